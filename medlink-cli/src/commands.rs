//! Command handlers over one open session: identity, trust store, radio and transport.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use futures::StreamExt;
use medlink_core::radio::sim::SimulatedAir;
use medlink_core::radio::{self, Radio};
use medlink_core::{
    decode_from_scan, encode_for_sharing, DeviceIdentity, FileKeyStore, IdentityManager, Message,
    PublicKey, RadioBackend, SharedTrustStore, TransportManager, TrustStore, TrustedDevice,
};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::config::Config;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan for nearby devices
    Scan {
        /// Seconds to listen (default from config)
        #[arg(long)]
        secs: Option<u64>,
    },
    /// Open a link to a device
    Connect { device_id: String },
    /// Send a text message to a connected device
    Send {
        device_id: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Send a text message to every connected device
    Broadcast {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Close the link to a device
    Disconnect { device_id: String },
    /// List known devices and their link state
    List,
    /// Print this device's exchange payload (creates the identity on first run)
    Identity,
    /// Manage trusted devices
    #[command(subcommand)]
    Trust(TrustCommand),
    /// Challenge a connected device to prove it holds a trusted key
    Auth { device_id: String },
    /// Read commands from stdin, one per line, keeping connections open
    Shell,
}

#[derive(Debug, Subcommand)]
pub enum TrustCommand {
    /// Trust the device described by an exchange payload
    Add {
        #[arg(required = true, num_args = 1..)]
        payload: Vec<String>,
    },
    /// List trusted devices
    List,
    /// Revoke a device by its base64 public key
    Remove { public_key: String },
}

/// A simulated peer that trusts us, answers challenges and acknowledges texts.
struct DemoPeer {
    payload: String,
    echo: JoinHandle<()>,
}

impl Drop for DemoPeer {
    fn drop(&mut self) {
        self.echo.abort();
    }
}

fn spawn_demo_peer(
    air: &SimulatedAir,
    name: &str,
    local_key: &PublicKey,
    config: medlink_core::TransportConfig,
) -> DemoPeer {
    let identity = Arc::new(DeviceIdentity::generate());
    let mut trust = TrustStore::new();
    trust.add(TrustedDevice {
        public_key: *local_key,
        display_name: None,
    });
    let radio = Arc::new(air.join(name, Some(name)));
    let (transport, mut incoming) =
        TransportManager::start(radio, identity.clone(), trust.into_shared(), config);
    let payload = encode_for_sharing(&identity, name);
    let name = name.to_string();
    let echo = tokio::spawn(async move {
        while let Some(msg) = incoming.recv().await {
            let Some(text) = msg.message.as_text() else {
                continue;
            };
            let ack = Message::text(name.clone(), &format!("ack: {text}"));
            if let Err(e) = transport.send(&msg.device_id, &ack).await {
                tracing::debug!(peer = %name, error = %e, "demo ack failed");
            }
        }
    });
    DemoPeer { payload, echo }
}

/// The radio side of a session: opened on the first command that needs it.
struct RadioSession {
    transport: TransportManager,
    printer: JoinHandle<()>,
    demo_peers: Vec<DemoPeer>,
}

impl Drop for RadioSession {
    fn drop(&mut self) {
        self.printer.abort();
    }
}

/// Everything one invocation (or one shell session) works with.
pub struct App {
    config: Config,
    identity: Arc<DeviceIdentity>,
    trust: SharedTrustStore,
    trust_path: PathBuf,
    radio: OnceCell<RadioSession>,
}

impl App {
    /// Load identity and trust store. The radio is not touched until a command needs it.
    pub async fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        let mut ids = IdentityManager::new(FileKeyStore::new(config.data_dir.join("identity.json")));
        let identity = ids.load_or_generate().context("loading device identity")?;
        let trust_path = config.data_dir.join("trusted_devices.json");
        let trust = TrustStore::load(&trust_path)
            .with_context(|| format!("loading {}", trust_path.display()))?
            .into_shared();
        Ok(Self {
            config,
            identity,
            trust,
            trust_path,
            radio: OnceCell::new(),
        })
    }

    async fn start_radio(&self) -> Result<RadioSession> {
        let transport_config = self.config.transport.to_transport_config();
        let mut demo_peers = Vec::new();
        let radio: Arc<dyn Radio> = match self.config.backend {
            RadioBackend::Simulated => {
                let air = SimulatedAir::new();
                let local = air.join("local", Some(&self.config.device_name));
                for name in &self.config.simulated.peers {
                    let peer = spawn_demo_peer(
                        &air,
                        name,
                        self.identity.public_key(),
                        transport_config.clone(),
                    );
                    tracing::info!(peer = %name, payload = %peer.payload, "simulated peer ready");
                    demo_peers.push(peer);
                }
                Arc::new(local)
            }
            RadioBackend::Ble => radio::open_ble().await.context("opening the radio")?,
        };

        let (transport, mut incoming) = TransportManager::start(
            radio,
            self.identity.clone(),
            self.trust.clone(),
            transport_config,
        );
        let printer = tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                let body = msg
                    .message
                    .as_text()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("<{} bytes>", msg.message.payload.len()));
                let mark = if msg.verified_key.is_some() { "*" } else { "" };
                println!("[{}{}] {}: {}", msg.device_id, mark, msg.message.sender, body);
            }
        });
        Ok(RadioSession {
            transport,
            printer,
            demo_peers,
        })
    }

    async fn transport(&self) -> Result<&TransportManager> {
        let session = self.radio.get_or_try_init(|| self.start_radio()).await?;
        Ok(&session.transport)
    }

    /// Open the radio now rather than on the first device command.
    pub async fn open_radio(&self) -> Result<()> {
        self.transport().await.map(|_| ())
    }

    /// Exchange payloads of the simulated peers (empty on real radios or before the radio opens).
    pub fn demo_payloads(&self) -> Vec<String> {
        self.radio
            .get()
            .map(|session| session.demo_peers.iter().map(|p| p.payload.clone()).collect())
            .unwrap_or_default()
    }

    async fn require_connected(&self, device_id: &str) -> Result<&TransportManager> {
        let transport = self.transport().await?;
        if !transport.is_connected(device_id).await {
            bail!("device {device_id} is not connected");
        }
        Ok(transport)
    }

    async fn save_trust(&self) -> Result<()> {
        self.trust
            .read()
            .await
            .save(&self.trust_path)
            .with_context(|| format!("saving {}", self.trust_path.display()))
    }

    pub async fn run(&self, command: Commands, out: &mut dyn Write) -> Result<()> {
        match command {
            Commands::Scan { secs } => {
                let secs = secs.unwrap_or(self.config.scan_secs);
                let transport = self.transport().await?;
                let Some(mut stream) = transport.start_scan().await? else {
                    writeln!(out, "scan already running")?;
                    return Ok(());
                };
                let deadline = tokio::time::sleep(Duration::from_secs(secs));
                tokio::pin!(deadline);
                let mut found = 0usize;
                loop {
                    tokio::select! {
                        device = stream.next() => match device {
                            Some(d) => {
                                found += 1;
                                let rssi = d.rssi.map(|r| format!("{r} dBm")).unwrap_or_default();
                                writeln!(
                                    out,
                                    "{}\t{}\t{}",
                                    d.id,
                                    d.name.as_deref().unwrap_or("-"),
                                    rssi
                                )?;
                            }
                            None => break,
                        },
                        _ = &mut deadline => break,
                    }
                }
                transport.stop_scan().await?;
                writeln!(out, "{found} device(s) found")?;
            }
            Commands::Connect { device_id } => {
                self.transport()
                    .await?
                    .connect(&device_id)
                    .await
                    .with_context(|| format!("connecting to {device_id}"))?;
                writeln!(out, "connected to {device_id}")?;
            }
            Commands::Send { device_id, text } => {
                let transport = self.require_connected(&device_id).await?;
                let message = Message::text(self.config.device_name.clone(), &text.join(" "));
                transport
                    .send(&device_id, &message)
                    .await
                    .with_context(|| format!("sending to {device_id}"))?;
                writeln!(out, "sent {} to {device_id}", message.id)?;
            }
            Commands::Broadcast { text } => {
                let message = Message::text(self.config.device_name.clone(), &text.join(" "));
                let delivered = self.transport().await?.broadcast(&message).await;
                writeln!(out, "delivered to {delivered} device(s)")?;
            }
            Commands::Disconnect { device_id } => {
                let transport = self.require_connected(&device_id).await?;
                transport.disconnect(&device_id).await?;
                writeln!(out, "disconnected from {device_id}")?;
            }
            Commands::List => {
                let connections = match self.radio.get() {
                    Some(session) => session.transport.connections().await,
                    None => Vec::new(),
                };
                if connections.is_empty() {
                    writeln!(out, "no devices")?;
                }
                for c in connections {
                    let verified = c
                        .verified_key
                        .map(|k| format!("verified {}", k.fingerprint()))
                        .unwrap_or_default();
                    writeln!(
                        out,
                        "{}\t{}\t{:?}\t{}",
                        c.device_id,
                        c.name.as_deref().unwrap_or("-"),
                        c.state,
                        verified
                    )?;
                }
            }
            Commands::Identity => {
                writeln!(
                    out,
                    "{}",
                    encode_for_sharing(&self.identity, &self.config.device_name)
                )?;
                writeln!(out, "fingerprint {}", self.identity.public_key().fingerprint())?;
            }
            Commands::Trust(TrustCommand::Add { payload }) => {
                let device = decode_from_scan(&payload.join(" "))?;
                let fingerprint = device.public_key.fingerprint();
                let added = self.trust.write().await.add(device);
                if added {
                    self.save_trust().await?;
                    writeln!(out, "trusted {fingerprint}")?;
                } else {
                    writeln!(out, "{fingerprint} already trusted")?;
                }
            }
            Commands::Trust(TrustCommand::List) => {
                let trust = self.trust.read().await;
                if trust.is_empty() {
                    writeln!(out, "no trusted devices")?;
                }
                for d in trust.list() {
                    writeln!(
                        out,
                        "{}\t{}\t{}",
                        d.public_key.fingerprint(),
                        d.display_name.as_deref().unwrap_or("-"),
                        d.public_key
                    )?;
                }
            }
            Commands::Trust(TrustCommand::Remove { public_key }) => {
                let key = PublicKey::from_base64(&public_key)?;
                if !self.trust.write().await.remove(&key) {
                    bail!("{} is not trusted", key.fingerprint());
                }
                self.save_trust().await?;
                writeln!(out, "removed {}", key.fingerprint())?;
            }
            Commands::Auth { device_id } => {
                let transport = self.require_connected(&device_id).await?;
                let key = transport
                    .authenticate(&device_id)
                    .await
                    .with_context(|| format!("authenticating {device_id}"))?;
                writeln!(out, "{device_id} verified as {}", key.fingerprint())?;
            }
            Commands::Shell => bail!("already in a shell"),
        }
        Ok(())
    }
}
