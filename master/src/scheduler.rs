use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Loop del scheduler: cada `scheduler_interval` intenta admitir el
/// siguiente job de la cola (y de paso cierra los que quedaron vencidos)
/// y purga los jobs en Error que pasaron la retención.
pub async fn run_scheduler_loop(state: AppState) {
    info!(
        "scheduler activo cada {:?} (vencimiento {:?}, retención de errores {:?})",
        state.config.scheduler_interval, state.config.staleness, state.config.error_retention
    );
    loop {
        sleep(state.config.scheduler_interval).await;
        tick_once(&state).await;
    }
}

/// Una pasada del scheduler. Devuelve cuántos jobs arrancó.
pub async fn tick_once(state: &AppState) -> usize {
    let started = match state.queue.clone().try_run_next_blocking().await {
        Ok(0) => {
            debug!("scheduler: nada para arrancar");
            0
        }
        Ok(started) => {
            info!("scheduler arrancó {} job(s)", started);
            started
        }
        Err(e) => {
            warn!("error en pasada del scheduler: {}", e);
            0
        }
    };

    if let Some(retention) = state.config.error_retention {
        if let Err(e) = state
            .reporter
            .purge_expired_errors(state.clock.now(), retention)
            .await
        {
            warn!("error purgando jobs en Error: {}", e);
        }
    }

    started
}
