//! Drive one loopback negotiation against a media pipeline server
//!
//! ```text
//! pipeline-loopback --offer-file offer.sdp --ws-uri ws://media.local:8888/kurento
//! pipeline-loopback --offer-file offer.sdp --query '?ice_servers=[{"urls":"stun:stun.l.google.com:19302"}]'
//! ```

mod file_peer;

use anyhow::{Context, Result};
use clap::Parser;
use loopback_infra_common::{log_welcome, parse_log_level, setup_logging, ErrorExt, LoggingConfig};
use loopback_session_core::{
    ConnectTarget, EndpointId, IceServer, SessionConfig, SessionController, SessionEvent, SessionInfo,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::file_peer::SdpFilePeerFactory;

#[derive(Parser, Debug)]
#[command(name = "pipeline-loopback", version, about = "Negotiate a WebRTC loopback through a remote media pipeline")]
struct Args {
    /// SDP offer to present as the local peer's
    #[arg(short, long, env = "LOOPBACK_OFFER_FILE")]
    offer_file: std::path::PathBuf,

    /// Media server host, used when no signaling URI is given
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Signaling URI (ws:// or wss://)
    #[arg(short, long, env = "LOOPBACK_WS_URI")]
    ws_uri: Option<String>,

    /// ICE servers as a JSON list, e.g. '[{"urls":"stun:stun.example.org"}]'
    #[arg(short, long)]
    ice_servers: Option<String>,

    /// Browser-style query string carrying ws_uri and ice_servers
    #[arg(short, long)]
    query: Option<String>,

    /// Data channel label
    #[arg(long)]
    label: Option<String>,

    /// Connect the endpoint's output to this endpoint instead of itself
    #[arg(long)]
    target_endpoint: Option<String>,

    /// Upper bound on each negotiation step, in seconds
    #[arg(long, default_value = "10")]
    step_timeout: u64,

    /// Keep the session up for this many seconds, or until ctrl-c when 0
    #[arg(long, default_value = "0")]
    hold: u64,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.query {
            Some(query) => SessionConfig::from_query(query, &self.host)?,
            None => SessionConfig::for_host(&self.host),
        };

        if let Some(uri) = &self.ws_uri {
            config = config.with_ws_uri(uri);
        }
        if let Some(servers) = &self.ice_servers {
            let servers: Vec<IceServer> = serde_json::from_str(servers).context("invalid --ice-servers")?;
            config = config.with_ice_servers(servers);
        }
        if let Some(label) = &self.label {
            config = config.with_data_channel_label(label);
        }
        if let Some(endpoint) = &self.target_endpoint {
            config = config.with_connect_target(ConnectTarget::Endpoint(EndpointId::from(endpoint.as_str())));
        }

        let config = config.with_step_timeout(Duration::from_secs(self.step_timeout));
        config.validate()?;
        Ok(config)
    }
}

fn summary(info: &SessionInfo) -> serde_json::Value {
    json!({
        "session": info.id.as_str(),
        "state": info.state.to_string(),
        "pipeline": info.pipeline.as_ref().map(|p| p.as_str()),
        "endpoint": info.endpoint.as_ref().map(|e| e.as_str()),
        "answer": info.remote_answer,
        "submittedCandidates": info.submitted_candidates,
        "appliedCandidates": info.applied_candidates,
        "channels": info
            .channels
            .iter()
            .map(|(label, state)| json!({ "label": label, "state": state.to_string() }))
            .collect::<Vec<_>>(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = ErrorExt::with_context(parse_log_level(&args.log_level), "cli", "parse --log-level")?;
    let mut logging = LoggingConfig::new(level, "pipeline-loopback");
    if args.json_logs {
        logging = logging.with_json();
    }
    setup_logging(logging.clone())?;
    log_welcome(&logging, env!("CARGO_PKG_VERSION"));

    let config = args.session_config()?;
    let offer = std::fs::read_to_string(&args.offer_file)
        .with_context(|| format!("reading offer from {}", args.offer_file.display()))?;

    info!("Negotiating with {}", config.ws_uri);
    let controller = SessionController::with_peer_factory(Arc::new(SdpFilePeerFactory::new(offer)));
    let mut events = controller.subscribe();

    let session = controller.negotiate(config).await?;
    info!("✅ Session {} connected", session);

    // Remote candidates keep trickling in after the loopback is connected
    let hold = async {
        if args.hold == 0 {
            tokio::signal::ctrl_c().await.ok();
        } else {
            tokio::time::sleep(Duration::from_secs(args.hold)).await;
        }
    };
    tokio::pin!(hold);

    loop {
        tokio::select! {
            _ = &mut hold => break,
            event = events.recv() => match event {
                Ok(SessionEvent::CandidateError { error, .. }) => warn!("{}", error),
                Ok(SessionEvent::Stopped { .. }) => {
                    warn!("Session stopped by the remote side");
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    if let Some(info) = controller.session_info().await {
        println!("{}", serde_json::to_string_pretty(&summary(&info))?);
    }

    controller.stop().await;
    controller.shutdown().await;
    info!("Session {} stopped", session);
    Ok(())
}
