// ID memento persistence
//
// The generator's last millisecond is saved in the meta table so IDs stay
// monotonic across restarts even if the wall clock steps back.

use crate::application::context::RequestContext;
use crate::application::jobs::Schema;
use crate::application::worker::constants::ID_MEMENTO_SAVE_INTERVAL;
use crate::domain::{Affinity, Backoff, IdGenerator, KindOptions};
use crate::error::Result;
use std::sync::Arc;
use tracing::debug;

/// Meta key holding the memento
pub const ID_MEMENTO_KEY: &str = "id_memento";

/// Built-in cron kind saving the memento
pub const ID_MEMENTO_KIND: &str = "taskbed.save_id_memento";

/// Memento to seed a generator with: the later of the stored memento and
/// the time of the newest stored job ID.
pub async fn load_id_memento(rc: &mut RequestContext) -> Result<u64> {
    rc.in_tx(Affinity::SafeReader, |rc| {
        Box::pin(async move {
            let tx = rc.tx()?;
            let stored = tx.load_meta(ID_MEMENTO_KEY).await?.unwrap_or(0).max(0) as u64;
            let newest = tx
                .newest_job_id()
                .await?
                .map(|id| id.epoch_millis())
                .unwrap_or(0);
            Ok(stored.max(newest))
        })
    })
    .await
}

pub async fn save_id_memento(rc: &mut RequestContext, ids: &IdGenerator) -> Result<()> {
    let memento = ids.memento() as i64;
    rc.in_tx(Affinity::SafeWriter, move |rc| {
        Box::pin(async move { rc.tx()?.save_meta(ID_MEMENTO_KEY, memento).await })
    })
    .await?;
    debug!(memento, "ID memento saved");
    Ok(())
}

/// Register the cron kind that saves the memento every minute
pub fn define_id_memento_cron(schema: &mut Schema, ids: Arc<IdGenerator>) {
    schema.cron(
        ID_MEMENTO_KIND,
        ID_MEMENTO_SAVE_INTERVAL,
        KindOptions::default().backoff(Backoff::never()),
        move |rc| {
            let ids = ids.clone();
            Box::pin(async move { save_id_memento(rc, &ids).await })
        },
    );
}
