pub mod collaborators;
pub mod connection;
pub mod delivery;
pub mod dispatcher;
pub mod fanout;
pub mod presence;
pub mod typing;

use std::sync::Arc;

use waggle_db::Database;

use crate::collaborators::{Directory, ModerationSink};
use crate::dispatcher::Dispatcher;
use crate::fanout::NotificationSink;

/// Everything a command handler needs. Shared by the gateway and the
/// REST layer.
#[derive(Clone)]
pub struct ChatState {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub notifier: Arc<dyn NotificationSink>,
    pub moderation: Arc<dyn ModerationSink>,
    pub directory: Arc<dyn Directory>,
    pub jwt_secret: String,
}
