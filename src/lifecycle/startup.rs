//! Ordered bring-up of the service's collaborators
//!
//! Order: limits, storage, database descriptor, upload directory, database,
//! then the reaper and the handler graph. Nothing is started here, so a
//! failure at any step leaves nothing to tear down.

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    api::create_router,
    config::Settings,
    error::BringUpError,
    server::RequestServer,
    services::{ensure_upload_dir, ImageCollection, PasteDb},
    state::{AppState, Phase},
    tasks::Reaper,
};

/// Everything the controller starts and stops, built but not yet running.
pub struct Components {
    pub reaper: Reaper,
    pub server: RequestServer,
    pub reap_interval: Duration,
    pub drain_timeout: Duration,
    /// Bound on waiting for an in-flight reap cycle at shutdown.
    pub reaper_stop_timeout: Option<Duration>,
}

/// Build all components from `settings`.
pub async fn bring_up(
    settings: &Settings,
    phase: watch::Receiver<Phase>,
) -> Result<Components, BringUpError> {
    settings.validate_limits()?;
    debug!(
        max_upload_bytes = settings.limits.max_upload_bytes,
        max_paste_bytes = settings.limits.max_paste_bytes,
        "Limits configured"
    );

    settings.validate_storage()?;
    debug!(
        upload_dir = %settings.storage.upload_dir.display(),
        public_prefix = %settings.storage.public_prefix,
        "Storage configured"
    );

    let database = settings.database()?;

    let upload_dir = &settings.storage.upload_dir;
    ensure_upload_dir(upload_dir)
        .await
        .map_err(|source| BringUpError::UploadDir {
            path: upload_dir.clone(),
            source,
        })?;

    let db = Arc::new(PasteDb::open(database).await.map_err(BringUpError::Database)?);

    let images = ImageCollection::new(Arc::clone(&db), upload_dir.clone());
    let reaper = Reaper::new(Arc::new(images));

    let state = AppState::new(db, phase, reaper.reports());
    let router = create_router(state, &settings.storage, &settings.limits);
    let server = RequestServer::new(settings.server.address(), router);

    info!(address = %server.addr(), "Bring-up complete");
    Ok(Components {
        reaper,
        server,
        reap_interval: settings.reaper.interval(),
        drain_timeout: settings.server.drain_timeout(),
        reaper_stop_timeout: settings.reaper.stop_timeout(),
    })
}
