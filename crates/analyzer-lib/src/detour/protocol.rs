//! Controller CLI commands for detour creation and removal
//!
//! The controller answers every command with a multi-line echo. Its fourth
//! line carries the status, which is `Success` on success and a free-form
//! reason otherwise. That position is a contract with the controller CLI.

use crate::models::{DetourRule, FlowKey, SwitchLoad};
use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

pub use async_trait::async_trait;

/// Zero-based index of the status line in a controller reply
pub const STATUS_LINE_INDEX: usize = 3;

/// Status literal reported by the controller on success
pub const SUCCESS_STATUS: &str = "Success";

/// Command requesting a segment-routed detour
pub const DETOUR_COMMAND: &str = "Path-Detour-SRv6";

/// Command removing a previously installed detour
pub const REMOVE_COMMAND: &str = "srv6-remove";

const DEVICE_URI_PREFIX: &str = "device:r";

/// Separator used by the store and the controller for paths and lists
const HOP_SEPARATOR: char = '-';

/// Ordered, single-consumer command channel to the network controller
#[async_trait]
pub trait ControllerChannel: Send + Sync {
    /// Send one command and return the raw reply
    async fn send(&mut self, command: &str) -> Result<String>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("flow path `{0}` needs at least two hops")]
    PathTooShort(String),
    #[error("controller reply has {lines} line(s), status expected on line {}", STATUS_LINE_INDEX + 1)]
    ShortReply { lines: usize },
}

/// Result of one detour request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetourOutcome {
    pub success: bool,
    /// Status line (or the raw reply when it had no status line)
    pub message: String,
    /// Ingress switch of the flow, which becomes the rule's device id
    pub source_device: String,
}

/// A fully formatted detour command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetourCommand {
    pub text: String,
    pub source_device: String,
}

fn device_uri(id: &str) -> String {
    format!("{}{}", DEVICE_URI_PREFIX, id)
}

/// Build the detour command for `flow`
///
/// `path` is the flow's current path as stored (`1-2-3-4`). The controller
/// infers the first hop, so it is stripped from the path argument. Every
/// congested switch is listed together with its load so that a single request
/// can steer around all of them.
pub fn format_detour_command(
    flow: &FlowKey,
    path: &str,
    congested: &[SwitchLoad],
) -> Result<DetourCommand, ProtocolError> {
    let hops: Vec<&str> = path
        .trim()
        .split(HOP_SEPARATOR)
        .filter(|hop| !hop.is_empty())
        .collect();

    let (source, destination) = match hops.as_slice() {
        [first, .., last] => (*first, *last),
        _ => return Err(ProtocolError::PathTooShort(path.to_string())),
    };

    let remaining_path = hops[1..].join("-");
    let avoid_ids = congested
        .iter()
        .map(|s| s.switch_id.to_string())
        .collect::<Vec<_>>()
        .join("-");
    let avoid_loads = congested
        .iter()
        .map(|s| format_load(s.load))
        .collect::<Vec<_>>()
        .join("-");

    let text = format!(
        "{} {} {} {} {} {} {} {} {}",
        DETOUR_COMMAND,
        device_uri(source),
        device_uri(destination),
        flow.src_ip,
        flow.dst_ip,
        flow.flow_label,
        remaining_path,
        avoid_ids,
        avoid_loads
    );

    Ok(DetourCommand {
        text,
        source_device: source.to_string(),
    })
}

/// Shortest decimal form that keeps a fractional part (`1.0`, `0.82`)
fn format_load(load: f64) -> String {
    format!("{:?}", load)
}

/// Build the removal command for an installed rule
pub fn format_remove_command(rule: &DetourRule) -> String {
    format!(
        "{} {} {} {} {} {} {} {}",
        REMOVE_COMMAND,
        device_uri(&rule.device_id),
        rule.flow.src_ip,
        rule.flow.dst_ip,
        rule.flow.flow_label,
        rule.src_mask,
        rule.dst_mask,
        rule.flow_label_mask
    )
}

fn terminal_sequence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // CSI sequences, two-byte escapes and the keypad-mode switches
        Regex::new(r"\x1B(?:[@-Z\\-_=>]|\[[0-?]*[ -/]*[@-~])")
            .expect("terminal escape pattern is valid")
    })
}

/// Remove ANSI/VT100 escape sequences
pub fn strip_terminal_sequences(text: &str) -> String {
    terminal_sequence_pattern().replace_all(text, "").into_owned()
}

/// Extract the cleaned status line from a raw controller reply
pub fn parse_status_line(raw: &str) -> Result<String, ProtocolError> {
    let lines: Vec<&str> = raw.trim_end().split('\n').collect();
    let line = lines
        .get(STATUS_LINE_INDEX)
        .ok_or(ProtocolError::ShortReply { lines: lines.len() })?;
    Ok(strip_terminal_sequences(line).trim().to_string())
}

/// Interpret a raw reply to a detour command
pub fn parse_detour_reply(raw: &str, source_device: &str) -> DetourOutcome {
    match parse_status_line(raw) {
        Ok(status) => DetourOutcome {
            success: status == SUCCESS_STATUS,
            message: status,
            source_device: source_device.to_string(),
        },
        Err(e) => {
            tracing::warn!(error = %e, raw = ?raw, "Unexpected controller reply shape");
            DetourOutcome {
                success: false,
                message: raw.trim().to_string(),
                source_device: source_device.to_string(),
            }
        }
    }
}

/// Ask the controller to detour `flow` around the congested switches
pub async fn request_detour(
    channel: &mut dyn ControllerChannel,
    flow: &FlowKey,
    path: &str,
    congested: &[SwitchLoad],
) -> Result<DetourOutcome> {
    let command = format_detour_command(flow, path, congested)?;
    tracing::debug!(command = %command.text, "Requesting detour");
    let reply = channel.send(&command.text).await?;
    Ok(parse_detour_reply(&reply, &command.source_device))
}

/// Remove a detour rule
///
/// The controller silently ignores removals that match nothing, so the reply
/// is returned for diagnostics only.
pub async fn remove_rule(channel: &mut dyn ControllerChannel, rule: &DetourRule) -> Result<String> {
    let command = format_remove_command(rule);
    tracing::debug!(command = %command, "Removing detour rule");
    channel.send(&command).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> FlowKey {
        FlowKey::new("2001:1:1::1", "2001:1:5::1", "3")
    }

    #[test]
    fn test_format_detour_command() {
        let congested = [SwitchLoad::new(12, 0.82), SwitchLoad::new(4, 0.7)];
        let command = format_detour_command(&flow(), "1-4-12-5", &congested).unwrap();

        assert_eq!(
            command.text,
            "Path-Detour-SRv6 device:r1 device:r5 2001:1:1::1 2001:1:5::1 3 4-12-5 12-4 0.82-0.7"
        );
        assert_eq!(command.source_device, "1");
    }

    #[test]
    fn test_whole_number_loads_keep_decimal_point() {
        let congested = [SwitchLoad::new(4, 1.0), SwitchLoad::new(12, 0.7)];
        let command = format_detour_command(&flow(), "1-4-12-5", &congested).unwrap();

        assert!(command.text.ends_with(" 4-12-5 4-12 1.0-0.7"));
        assert_eq!(format_load(0.0), "0.0");
        assert_eq!(format_load(0.815), "0.815");
    }

    #[test]
    fn test_format_detour_command_rejects_single_hop() {
        assert_eq!(
            format_detour_command(&flow(), "7", &[]),
            Err(ProtocolError::PathTooShort("7".to_string()))
        );
        assert!(format_detour_command(&flow(), "", &[]).is_err());
    }

    #[test]
    fn test_format_remove_command() {
        let rule = DetourRule::new("1", flow());
        assert_eq!(
            format_remove_command(&rule),
            "srv6-remove device:r1 2001:1:1::1 2001:1:5::1 3 128 128 255"
        );
    }

    #[test]
    fn test_success_reply() {
        let raw = "onos> Path-Detour-SRv6 device:r1 ...\r\nComputing path\r\nInstalling\r\n\x1b[32mSuccess\x1b[0m\r\n\x1b>onos> ";
        let outcome = parse_detour_reply(raw, "1");
        assert!(outcome.success);
        assert_eq!(outcome.message, "Success");
        assert_eq!(outcome.source_device, "1");
    }

    #[test]
    fn test_failure_reply_keeps_message() {
        let raw = ["", "", "", "Failure: no alternate path"].join("\n");
        let outcome = parse_detour_reply(&raw, "1");
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Failure: no alternate path");
    }

    #[test]
    fn test_success_must_match_exactly() {
        let raw = "a\nb\nc\nSuccessful\n";
        assert!(!parse_detour_reply(raw, "1").success);
    }

    #[test]
    fn test_short_reply_is_failure() {
        assert_eq!(
            parse_status_line("only\ntwo"),
            Err(ProtocolError::ShortReply { lines: 2 })
        );

        let outcome = parse_detour_reply("Error: unknown command", "1");
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Error: unknown command");
    }

    #[test]
    fn test_strip_terminal_sequences() {
        assert_eq!(strip_terminal_sequences("\x1b[1;31mFailure\x1b[0m"), "Failure");
        assert_eq!(strip_terminal_sequences("\x1b>Success"), "Success");
        assert_eq!(strip_terminal_sequences("\x1b=plain"), "plain");
    }

    struct ScriptedChannel {
        reply: String,
        sent: Vec<String>,
    }

    #[async_trait]
    impl ControllerChannel for ScriptedChannel {
        async fn send(&mut self, command: &str) -> Result<String> {
            self.sent.push(command.to_string());
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn test_request_detour_round_trip() {
        let mut channel = ScriptedChannel {
            reply: "echo\nline\nline\nSuccess\n".to_string(),
            sent: vec![],
        };

        let outcome = request_detour(&mut channel, &flow(), "2-12-5", &[SwitchLoad::new(12, 0.9)])
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.source_device, "2");
        assert_eq!(channel.sent.len(), 1);
        assert!(channel.sent[0].ends_with(" 12-5 12 0.9"));
    }

    #[tokio::test]
    async fn test_request_detour_with_short_path_sends_nothing() {
        let mut channel = ScriptedChannel {
            reply: String::new(),
            sent: vec![],
        };

        let result = request_detour(&mut channel, &flow(), "5", &[]).await;
        assert!(result.is_err());
        assert!(channel.sent.is_empty());
    }
}
