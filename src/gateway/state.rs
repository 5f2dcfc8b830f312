//! Shared gateway state.

use std::sync::Arc;

use crate::binding::BindingService;
use crate::storage::ChannelStorage;
use crate::workflow::WorkflowApi;

pub struct AppState<S: ChannelStorage, W: WorkflowApi> {
    pub binding: Arc<BindingService<S, W>>,
}

impl<S: ChannelStorage, W: WorkflowApi> Clone for AppState<S, W> {
    fn clone(&self) -> Self {
        Self {
            binding: self.binding.clone(),
        }
    }
}

impl<S: ChannelStorage, W: WorkflowApi> AppState<S, W> {
    pub fn new(binding: Arc<BindingService<S, W>>) -> Self {
        Self { binding }
    }
}
