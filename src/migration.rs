//! Migrates hub-to-hub traffic from bootstrap links to the hub-mesh overlay
//! once the overlay can carry it, so the same frame is never forwarded down
//! both paths at once (I5).

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::events::HubEvent;
use crate::hub_mesh::HubMeshClient;
use crate::state::HubState;

pub struct MigrationController {
    state: HubState,
    hub_mesh: Arc<HubMeshClient>,
}

impl MigrationController {
    pub fn new(state: HubState, hub_mesh: Arc<HubMeshClient>) -> Self {
        Self { state, hub_mesh }
    }

    /// Poll overlay readiness on an interval; once ready (and, if
    /// configured, stable for `mesh_migration_delay_ms`), act once and
    /// then stop polling.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                if self.hub_mesh.is_overlay_ready() {
                    if self.state.config.mesh_migration_delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(self.state.config.mesh_migration_delay_ms))
                            .await;
                        if !self.hub_mesh.is_overlay_ready() {
                            continue;
                        }
                    }
                    self.migrate();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
    }

    fn migrate(&self) {
        if !self.state.hubs.is_empty() {
            for record in self.state.hubs.all() {
                if self.state.connections.contains(&record.peer_id) {
                    self.state.connections.remove(&record.peer_id);
                    self.state.mark_migrated_to_overlay(&record.peer_id);
                }
                if self.state.hubs.unregister(&record.peer_id).is_some() {
                    self.state.events.emit(HubEvent::HubUnregistered { peer_id: record.peer_id });
                }
            }
            // Dropping each sender makes the owning connection_loop's
            // `rx.recv()` observe closure and tear the link down.
            self.state.bootstrap_links.clear();
        }
        info!("hub-mesh overlay migration complete");
        self.state.events.emit(HubEvent::HubMeshMigrated);
    }
}
