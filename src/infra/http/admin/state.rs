use std::sync::Arc;

use crate::cache::{IndexSettingsRegistry, QueryResultCache};

#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<QueryResultCache>,
    pub indices: Arc<IndexSettingsRegistry>,
}
