use crate::source::{AppointmentSource, FetchError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use slotsync_core::{Appointment, Scope};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Appointment source backed by the scheduling REST API. Session cookies are
/// kept in the client's cookie store, so a refreshed session carries over to
/// the retried request.
#[derive(Clone)]
pub struct RestAppointmentSource {
    client: Client,
    base: Url,
}

impl RestAppointmentSource {
    pub fn new(base: Url) -> Result<Self, FetchError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        Ok(Self::with_client(client, base))
    }

    pub fn with_client(client: Client, base: Url) -> Self {
        Self { client, base }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn appointments_url(&self, scope: &Scope) -> Result<Url, FetchError> {
        let mut url = self.endpoint(&["appointments_by_date", &scope.date_key()])?;
        if let Some(branch) = scope.branch_query() {
            url.query_pairs_mut().append_pair("branch", branch);
        }
        Ok(url)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::Transport(format!("base url cannot hold a path: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_appointments(&self, url: &Url) -> Result<reqwest::Response, FetchError> {
        self.client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))
    }

    async fn refresh_session(&self) -> Result<bool, FetchError> {
        let url = self.endpoint(&["refresh"])?;
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl AppointmentSource for RestAppointmentSource {
    async fn fetch(&self, scope: &Scope) -> Result<Vec<Appointment>, FetchError> {
        let url = self.appointments_url(scope)?;
        let mut response = self.get_appointments(&url).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if !self.refresh_session().await? {
                warn!(event = "session_refresh_failed", scope = %scope);
                return Err(FetchError::SessionExpired);
            }
            info!(event = "session_refreshed", scope = %scope);
            response = self.get_appointments(&url).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(FetchError::SessionExpired);
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let appointments: Vec<Appointment> = response
            .json()
            .await
            .map_err(|err| FetchError::Decode(err.to_string()))?;
        debug!(event = "appointments_fetched", scope = %scope, count = appointments.len());
        Ok(appointments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use slotsync_core::Branch;

    fn scope(branch: Branch) -> Scope {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).expect("valid date");
        Scope::new(branch, date)
    }

    #[test]
    fn appointments_url_omits_wildcard_branch() {
        let base = Url::parse("http://127.0.0.1:8000/").expect("url");
        let source = RestAppointmentSource::with_client(Client::new(), base);

        let url = source.appointments_url(&scope(Branch::All)).expect("url");
        assert_eq!(url.as_str(), "http://127.0.0.1:8000/appointments_by_date/2024-06-01");

        let url = source.appointments_url(&scope(Branch::Gagarina)).expect("url");
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8000/appointments_by_date/2024-06-01?branch=gagarina"
        );
    }

    #[test]
    fn appointments_url_keeps_base_path_prefix() {
        let base = Url::parse("https://api.example.com/v1").expect("url");
        let source = RestAppointmentSource::with_client(Client::new(), base);
        let url = source.appointments_url(&scope(Branch::All)).expect("url");
        assert_eq!(url.as_str(), "https://api.example.com/v1/appointments_by_date/2024-06-01");
    }
}
