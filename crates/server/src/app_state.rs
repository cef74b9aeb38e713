use server_api::ApiContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    /// Bound of each session's outbound queue.
    pub(crate) outbound_capacity: usize,
    pub(crate) enforce_token_expiry: bool,
}
