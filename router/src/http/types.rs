use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema)]
pub(crate) struct ClassifyRequest {
    /// Text forwarded to the downstream classifier
    #[schema(example = "What is Deep Learning?")]
    pub sequence: String,
}

#[derive(Serialize, ToSchema)]
pub(crate) struct ClassifyResponse {
    /// Label returned by the downstream classifier
    #[schema(example = "question")]
    pub result: String,
}
