use std::sync::Arc;

use parking_lot::Mutex;

use cyberchat_discovery::DiscoveryService;
use cyberchat_shared::Identity;
use cyberchat_store::Database;

use crate::events::EventBus;
use crate::peers::PeerManager;
use crate::pipeline::MessagePipeline;

/// The store is a process-wide singleton injected everywhere it is
/// needed; rusqlite connections are not `Sync`, so access goes through
/// a short-lived mutex never held across an await.
pub type SharedDb = Arc<Mutex<Database>>;

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDb,
    pub identity: Arc<Identity>,
    pub bus: Arc<EventBus>,
    pub peers: Arc<PeerManager>,
    pub discovery: Arc<DiscoveryService>,
    pub pipeline: Arc<MessagePipeline>,
    pub client_api_key: String,
}
