//! Headless session client.
//!
//! Joins one tutoring session with the real transport and webrtc peer and
//! logs every session event until ctrl-c. Reads `TUTOR_SESSION_ID`,
//! `TUTOR_USER_ID` and `TUTOR_TOKEN`, plus the `SyncConfig::from_env`
//! overrides.

use log::{info, warn};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use tutor_sync::{
    build_transport, open_cache, Credential, EngineParts, RtcMediaDevices, RtcPeer, SessionContext, SessionEvent,
    SessionSyncEngine, SharedProfile, SyncConfig,
};

fn required<T: std::str::FromStr>(name: &str) -> Result<T, Box<dyn Error>>
where
    T::Err: Error + 'static,
{
    let raw = std::env::var(name).map_err(|_| format!("{name} is not set"))?;
    Ok(raw.trim().parse::<T>()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = SyncConfig::from_env()?;
    let ctx = SessionContext {
        session_id: required("TUTOR_SESSION_ID")?,
        local_user: required("TUTOR_USER_ID")?,
        credential: Credential::bearer(required::<String>("TUTOR_TOKEN")?),
    };
    info!(
        "Starting session client for session {} as user {} ({:?} transport)",
        ctx.session_id, ctx.local_user, config.transport
    );

    let (peer, peer_events) = RtcPeer::new(&config.ice_servers).await?;
    let parts = EngineParts {
        transport: build_transport(&config, &ctx)?,
        peer: Arc::new(peer),
        peer_events: Some(peer_events),
        media: Arc::new(RtcMediaDevices::new(format!("session-{}", ctx.session_id))),
        cache: open_cache(&config)?,
    };

    let profile = SharedProfile::new();
    let local_user = ctx.local_user;
    let engine = SessionSyncEngine::new(ctx, &config, parts).with_credit_sink(Arc::new(profile.clone()));
    let handle = engine.spawn();
    let mut events = handle.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving session");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::SessionEnded { ended_by, summary }) => {
                    info!("Session ended by {ended_by:?}: {summary:?}");
                    if let Some(credits) = profile.credits(local_user) {
                        info!("Balance: {credits:.2}");
                    }
                    break;
                }
                Ok(event) => info!("{event:?}"),
                Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await?;
    Ok(())
}
