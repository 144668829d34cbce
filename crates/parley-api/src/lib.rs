pub mod messages;
pub mod middleware;
pub mod presence;

use std::sync::Arc;

use parley_gateway::hub::Hub;
use parley_store::Database;

pub type AppState = Arc<AppStateInner>;

/// Shared state for the REST surface. The hub is only consulted for
/// presence reads; history is served straight from the durable store,
/// independent of any live connection.
pub struct AppStateInner {
    pub store: Arc<Database>,
    pub hub: Hub,
}
