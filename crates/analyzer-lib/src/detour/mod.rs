//! Detour lifecycle: controller protocol, session, rule bookkeeping and audit

mod audit;
mod protocol;
mod rules;
mod session;

pub use audit::{AuditLog, RuleAction};
pub use protocol::{
    async_trait, format_detour_command, format_remove_command, parse_detour_reply,
    parse_status_line, remove_rule, request_detour, strip_terminal_sequences, ControllerChannel,
    DetourCommand, DetourOutcome, ProtocolError, STATUS_LINE_INDEX, SUCCESS_STATUS,
};
pub use rules::{DetourRuleManager, RuleSet};
pub use session::{ControllerSession, SessionConfig, ShellTransport, SshShell};
