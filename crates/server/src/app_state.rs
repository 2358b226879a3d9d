use review_engine::ReviewContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) review: ReviewContext,
}
