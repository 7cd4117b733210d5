use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::clock::ReportingClock;
use crate::health::HealthMetrics;
use crate::store::{EventWriter, IngestOutcome, RawEvent};

pub const MAX_USER_ID_LEN: usize = 64;
pub const MAX_PLATFORM_LEN: usize = 32;
pub const MAX_REGION_LEN: usize = 64;
pub const MAX_APP_VERSION_LEN: usize = 32;

/// Payload of an event report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportEventRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
    /// RFC 3339; any offset is converted to UTC. Defaults to the time of
    /// receipt.
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("{field} must be at most {max} bytes")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("event store unavailable")]
    Store(#[source] anyhow::Error),
}

impl IngestError {
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Store(_))
    }

    /// Short label used for the rejection metric.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "missing_field",
            Self::FieldTooLong { .. } => "field_too_long",
            Self::Store(_) => "store",
        }
    }
}

impl ReportEventRequest {
    /// Validates the request and turns it into an event stamped with
    /// `received_at` when the client sent no time.
    pub fn into_event(self, received_at: DateTime<Utc>) -> Result<RawEvent, IngestError> {
        let region = self.region.unwrap_or_default();
        let app_version = self.app_version.unwrap_or_default();

        require("user_id", &self.user_id)?;
        require("platform", &self.platform)?;
        limit("user_id", &self.user_id, MAX_USER_ID_LEN)?;
        limit("platform", &self.platform, MAX_PLATFORM_LEN)?;
        limit("region", &region, MAX_REGION_LEN)?;
        limit("app_version", &app_version, MAX_APP_VERSION_LEN)?;

        Ok(RawEvent {
            user_id: self.user_id,
            platform: self.platform,
            region,
            app_version,
            event_time: self.event_time.unwrap_or(received_at),
        })
    }
}

fn require(field: &'static str, value: &str) -> Result<(), IngestError> {
    if value.trim().is_empty() {
        return Err(IngestError::MissingField { field });
    }
    Ok(())
}

fn limit(field: &'static str, value: &str, max: usize) -> Result<(), IngestError> {
    if value.len() > max {
        return Err(IngestError::FieldTooLong { field, max });
    }
    Ok(())
}

/// Validates event reports and hands them to the store.
pub struct Ingestor<W> {
    writer: Arc<W>,
    clock: Arc<dyn ReportingClock>,
    health: Option<Arc<HealthMetrics>>,
}

impl<W> Clone for Ingestor<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            clock: Arc::clone(&self.clock),
            health: self.health.clone(),
        }
    }
}

impl<W: EventWriter> Ingestor<W> {
    pub fn new(writer: Arc<W>, clock: Arc<dyn ReportingClock>) -> Self {
        Self {
            writer,
            clock,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Records one event report.
    pub async fn report(&self, request: ReportEventRequest) -> Result<IngestOutcome, IngestError> {
        let result = self.record(request).await;

        if let Some(h) = &self.health {
            match &result {
                Ok(outcome) => {
                    h.events_reported.inc();
                    if outcome.new_user {
                        h.new_users.inc();
                    }
                }
                Err(e) => h.events_rejected.with_label_values(&[e.reason()]).inc(),
            }
        }

        result
    }

    async fn record(&self, request: ReportEventRequest) -> Result<IngestOutcome, IngestError> {
        let event = request.into_event(self.clock.now())?;
        let user_id = event.user_id.clone();

        let outcome = self.writer.record_event(event).await.map_err(|e| {
            tracing::warn!(%user_id, error = %e, "recording event failed");
            IngestError::Store(e)
        })?;

        if outcome.new_user {
            tracing::debug!(%user_id, "new user");
        }

        Ok(outcome)
    }
}
