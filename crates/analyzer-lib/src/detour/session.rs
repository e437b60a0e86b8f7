//! Interactive controller CLI session over SSH
//!
//! One persistent shell per analyzer. Each command is written followed by a
//! newline, then the session waits for the settle delay and drains whatever
//! the controller printed until the shell goes quiet or the read deadline
//! passes.

use super::protocol::{async_trait, ControllerChannel};
use anyhow::{Context, Result};
use russh::client;
use russh::{Channel, ChannelMsg};
use russh_keys::key::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

/// Quiet period after which a reply is considered complete
const IDLE_READ_GAP: Duration = Duration::from_millis(50);

/// Terminal requested for the shell; the controller CLI expects a pty
const TERMINAL_TYPE: &str = "vt100";
const TERMINAL_COLUMNS: u32 = 80;
const TERMINAL_ROWS: u32 = 24;

/// Settings for the controller session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    /// SSH port of the controller CLI
    pub port: u16,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    /// Time the controller is given to execute a command before reading
    pub settle_delay: Duration,
    /// Upper bound on draining a single reply
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8101,
            username: "onos".to_string(),
            password: "rocks".to_string(),
            connect_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(1),
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Byte stream of an interactive shell
#[async_trait]
pub trait ShellTransport: Send + Sync {
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Next chunk of output, `None` once the remote side closed the shell
    ///
    /// Must be cancel safe: reads are raced against the idle gap.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Accepts any host key; the controller is addressed by a trusted config
struct ControllerKeyPolicy;

#[async_trait]
impl client::Handler for ControllerKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        debug!(fingerprint = %server_public_key.fingerprint(), "Controller host key");
        Ok(true)
    }
}

/// Shell channel of an authenticated SSH connection
pub struct SshShell {
    // Dropping the handle tears down the connection
    _connection: client::Handle<ControllerKeyPolicy>,
    channel: Channel<client::Msg>,
}

impl SshShell {
    /// Connect, authenticate with a password and open a pty shell
    pub async fn open(config: &SessionConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let ssh_config = Arc::new(client::Config::default());

        let mut connection = timeout(
            config.connect_timeout,
            client::connect(ssh_config, addr.clone(), ControllerKeyPolicy),
        )
        .await
        .with_context(|| format!("Timed out connecting to controller at {}", addr))?
        .with_context(|| format!("Failed to connect to controller at {}", addr))?;

        let accepted = connection
            .authenticate_password(config.username.clone(), config.password.clone())
            .await
            .context("Controller authentication failed")?;
        if !accepted {
            anyhow::bail!("Controller rejected credentials for user `{}`", config.username);
        }

        let mut channel = connection
            .channel_open_session()
            .await
            .context("Failed to open controller session channel")?;
        channel
            .request_pty(
                false,
                TERMINAL_TYPE,
                TERMINAL_COLUMNS,
                TERMINAL_ROWS,
                0,
                0,
                &[],
            )
            .await
            .context("Failed to request a terminal")?;
        channel
            .request_shell(true)
            .await
            .context("Failed to start the controller shell")?;

        Ok(Self {
            _connection: connection,
            channel,
        })
    }
}

#[async_trait]
impl ShellTransport for SshShell {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.channel
            .data(bytes)
            .await
            .context("Failed to write to controller shell")
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::ExtendedData { data, .. }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(None),
                Some(_) => continue,
            }
        }
    }
}

/// Open command session with the network controller
pub struct ControllerSession<T = SshShell> {
    shell: T,
    config: SessionConfig,
}

impl ControllerSession<SshShell> {
    /// Log in over SSH and discard the banner
    pub async fn connect(config: SessionConfig) -> Result<Self> {
        let shell = SshShell::open(&config).await?;
        let session = Self::start(shell, config).await?;
        info!(
            host = %session.config.host,
            port = session.config.port,
            "Controller session established"
        );
        Ok(session)
    }
}

impl<T: ShellTransport> ControllerSession<T> {
    /// Wrap an open shell, waiting out and discarding its banner
    pub async fn start(shell: T, config: SessionConfig) -> Result<Self> {
        let mut session = Self { shell, config };

        tokio::time::sleep(session.config.settle_delay).await;
        let banner = session.drain().await?;
        debug!(banner = %banner, "Controller session banner");

        Ok(session)
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.shell.write(format!("{}\n", line).as_bytes()).await
    }

    /// Read until the shell stays idle for `IDLE_READ_GAP` or the deadline passes
    async fn drain(&mut self) -> Result<String> {
        let deadline = Instant::now() + self.config.read_timeout;
        let mut output = Vec::new();

        while Instant::now() < deadline {
            match timeout(IDLE_READ_GAP, self.shell.read_chunk()).await {
                Ok(Ok(Some(chunk))) => output.extend_from_slice(&chunk),
                Ok(Ok(None)) => anyhow::bail!("Controller closed the session"),
                Ok(Err(e)) => return Err(e).context("Failed to read from controller session"),
                Err(_) => break,
            }
        }

        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

#[async_trait]
impl<T: ShellTransport> ControllerChannel for ControllerSession<T> {
    async fn send(&mut self, command: &str) -> Result<String> {
        self.write_line(command).await?;
        tokio::time::sleep(self.config.settle_delay).await;
        self.drain().await
    }
}
