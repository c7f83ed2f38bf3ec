/// Per-request context carrying the operation identity and correlation headers.
/// Built once per inbound verb call and passed explicitly to everything that logs or
/// records on behalf of that call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Caller-supplied operation id (the `operationId` query parameter).
    pub operation_id: String,
    /// Value of the inbound correlation header, echoed back on the response.
    pub correlation_id: Option<String>,
    /// Subscription the caller acts on behalf of. Only used for logging.
    pub subscription_id: Option<String>,
}

impl RequestContext {
    #[must_use]
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            correlation_id: None,
            subscription_id: None,
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_subscription_id(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    /// Correlation id for log fields; `"-"` when the caller sent none.
    #[must_use]
    pub fn correlation(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or("-")
    }
}
