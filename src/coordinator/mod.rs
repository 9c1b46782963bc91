use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::auth::{AccessToken, AuthProvider, OAuth2Client, POWERBI_SCOPE};
use crate::config::{Config, OAuth2ClientConfig};
use crate::error::{Error, Result};
use crate::refresh::{
    DatasetTarget, PowerBiClient, RefreshObjectRef, RefreshOutcome, RefreshRequest,
    RefreshService, RefreshStatus, DEFAULT_API_BASE_URL,
};

/// Poll intervals below this are allowed but hammer the service
const MIN_RECOMMENDED_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Rejects blank identity/target fields and an empty or malformed object list,
/// naming every offending field.
pub fn validate_parameters(
    credentials: &OAuth2ClientConfig,
    target: &DatasetTarget,
    objects: &[RefreshObjectRef],
) -> Result<()> {
    let required = [
        ("client_id", &credentials.client_id),
        ("client_secret", &credentials.client_secret),
        ("tenant_id", &credentials.tenant_id),
        ("workspace_id", &target.workspace_id),
        ("dataset_id", &target.dataset_id),
    ];

    let mut missing: Vec<String> = required
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name.to_string())
        .collect();

    if objects.is_empty() {
        missing.push("refresh_objects".to_string());
    }
    for (index, object) in objects.iter().enumerate() {
        if object.table.trim().is_empty() {
            missing.push(format!("refresh_objects[{}].table", index));
        }
    }

    if !missing.is_empty() {
        return Err(Error::Validation(format!(
            "Missing or empty required parameters: {}",
            missing.join(", ")
        )));
    }

    Ok(())
}

/// Drives one refresh of one dataset: authenticate, trigger, poll to a terminal state.
pub struct RefreshCoordinator {
    target: DatasetTarget,
    objects: Vec<RefreshObjectRef>,
    scope: String,
    auth_provider: Arc<dyn AuthProvider>,
    service: Arc<dyn RefreshService>,
    access_token: Option<AccessToken>,
}

impl RefreshCoordinator {
    /// Coordinator talking to Azure AD and the public Power BI API
    pub fn new(
        credentials: OAuth2ClientConfig,
        target: DatasetTarget,
        objects: Vec<RefreshObjectRef>,
    ) -> Result<Self> {
        let auth_provider = Arc::new(OAuth2Client::new(credentials.clone())?);
        let service = Arc::new(PowerBiClient::new(DEFAULT_API_BASE_URL)?);
        Self::with_services(credentials, target, objects, auth_provider, service)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let auth_provider = Arc::new(OAuth2Client::new(config.oauth2client.clone())?);
        let service = Arc::new(PowerBiClient::with_timeout(
            config.powerbi.api_base_url.clone(),
            Duration::from_secs(config.powerbi.timeout_seconds),
        )?);

        Ok(Self::with_services(
            config.oauth2client.clone(),
            config.target(),
            config.objects.clone(),
            auth_provider,
            service,
        )?
        .with_scope(config.powerbi.scope.clone()))
    }

    pub fn with_services(
        credentials: OAuth2ClientConfig,
        target: DatasetTarget,
        objects: Vec<RefreshObjectRef>,
        auth_provider: Arc<dyn AuthProvider>,
        service: Arc<dyn RefreshService>,
    ) -> Result<Self> {
        validate_parameters(&credentials, &target, &objects)?;

        Ok(Self {
            target,
            objects,
            scope: POWERBI_SCOPE.to_string(),
            auth_provider,
            service,
            access_token: None,
        })
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn target(&self) -> &DatasetTarget {
        &self.target
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    pub async fn authenticate(&mut self) -> Result<()> {
        let token = self.auth_provider.get_token(&self.scope).await?;
        if token.secret().trim().is_empty() {
            return Err(Error::Auth(
                "Credential provider returned an empty access token".to_string(),
            ));
        }
        self.access_token = Some(token);
        Ok(())
    }

    fn token(&self) -> Result<&AccessToken> {
        self.access_token.as_ref().ok_or_else(|| {
            Error::InvalidState("Not authenticated; call authenticate() first".to_string())
        })
    }

    pub fn refresh_request(&self) -> RefreshRequest {
        RefreshRequest::full(self.target.clone(), self.objects.clone())
    }

    /// Queue a full refresh. Each call issues a new request.
    pub async fn trigger_refresh(&self) -> Result<()> {
        let token = self.token()?;
        let request = self.refresh_request();

        info!(
            "Triggering refresh of dataset {} in workspace {} ({} objects)",
            self.target.dataset_id,
            self.target.workspace_id,
            request.objects.len()
        );
        self.service.trigger_refresh(token, &request).await
    }

    /// Poll until the latest refresh leaves `Unknown`/`InProgress`. Never gives up on its own.
    pub async fn await_completion(&self, poll_interval: Duration) -> Result<RefreshOutcome> {
        self.poll_until_terminal(poll_interval, None).await
    }

    /// Like [`Self::await_completion`] but fails with [`Error::Timeout`] once `max_wait` has elapsed
    pub async fn await_completion_within(
        &self,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<RefreshOutcome> {
        self.poll_until_terminal(poll_interval, Some(max_wait)).await
    }

    pub async fn run(
        &mut self,
        poll_interval: Duration,
        max_wait: Option<Duration>,
    ) -> Result<RefreshOutcome> {
        self.authenticate().await?;
        self.trigger_refresh().await?;
        self.poll_until_terminal(poll_interval, max_wait).await
    }

    async fn poll_until_terminal(
        &self,
        poll_interval: Duration,
        max_wait: Option<Duration>,
    ) -> Result<RefreshOutcome> {
        if poll_interval.is_zero() {
            return Err(Error::Validation(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if poll_interval < MIN_RECOMMENDED_POLL_INTERVAL {
            warn!(
                "Poll interval {:?} is below {:?}; the service may throttle requests",
                poll_interval, MIN_RECOMMENDED_POLL_INTERVAL
            );
        }
        let token = self.token()?;

        let started_at = Utc::now();
        let clock = Instant::now();
        info!("Started polling at {}", started_at.format("%Y-%m-%d %H:%M:%S"));

        let mut polls: u64 = 0;
        loop {
            polls += 1;
            let record = self.service.latest_refresh(token, &self.target).await?;
            if record.is_none() {
                debug!("No refresh listed yet for dataset {}", self.target.dataset_id);
            }
            let status = record
                .as_ref()
                .map(|r| r.status.clone())
                .unwrap_or_else(RefreshStatus::unknown);

            info!(
                "Current refresh status: {} at {}",
                status,
                Utc::now().format("%H:%M:%S")
            );

            if status.is_terminal() {
                let ended_at = Utc::now();
                let duration_seconds = clock.elapsed().as_secs_f64();
                info!("Finished at {}", ended_at.format("%Y-%m-%d %H:%M:%S"));
                info!(
                    "Total refresh time: {:.2} seconds over {} polls",
                    duration_seconds, polls
                );

                let (request_id, service_exception_json) = record
                    .map(|r| (r.request_id, r.service_exception_json))
                    .unwrap_or_default();

                return Ok(RefreshOutcome {
                    status,
                    started_at,
                    ended_at,
                    duration_seconds,
                    request_id,
                    service_exception_json,
                });
            }

            let pause = match max_wait {
                Some(max_wait) => {
                    let elapsed = clock.elapsed();
                    if elapsed >= max_wait {
                        return Err(Error::Timeout(format!(
                            "Refresh still '{}' after waiting {:?}",
                            status, max_wait
                        )));
                    }
                    // Last poll lands on the deadline rather than a full interval past it
                    poll_interval.min(max_wait - elapsed)
                }
                None => poll_interval,
            };

            sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::RefreshRecord;
    use mockall::mock;
    use std::sync::Mutex;

    mock! {
        pub Auth {}

        #[async_trait::async_trait]
        impl AuthProvider for Auth {
            async fn get_token(&self, scope: &str) -> Result<AccessToken>;
        }
    }

    mock! {
        pub Service {}

        #[async_trait::async_trait]
        impl RefreshService for Service {
            async fn trigger_refresh(&self, token: &AccessToken, request: &RefreshRequest) -> Result<()>;
            async fn latest_refresh(
                &self,
                token: &AccessToken,
                target: &DatasetTarget,
            ) -> Result<Option<RefreshRecord>>;
        }
    }

    fn credentials() -> OAuth2ClientConfig {
        OAuth2ClientConfig::new("client-id", "client-secret", "tenant-id")
    }

    fn target() -> DatasetTarget {
        DatasetTarget::new("workspace-id", "dataset-id")
    }

    fn objects() -> Vec<RefreshObjectRef> {
        vec![
            RefreshObjectRef::partition("DimCustomer", "DimCustomer"),
            RefreshObjectRef::table("DimDate"),
        ]
    }

    fn authorized() -> MockAuth {
        let mut auth = MockAuth::new();
        auth.expect_get_token()
            .returning(|_| Ok(AccessToken::new("token")));
        auth
    }

    fn record(status: &str) -> RefreshRecord {
        RefreshRecord {
            status: RefreshStatus::new(status),
            ..Default::default()
        }
    }

    async fn authenticated(service: MockService) -> RefreshCoordinator {
        let mut coordinator = RefreshCoordinator::with_services(
            credentials(),
            target(),
            objects(),
            Arc::new(authorized()),
            Arc::new(service),
        )
        .unwrap();
        coordinator.authenticate().await.unwrap();
        coordinator
    }

    /// Service answering successive polls from `statuses`; `None` means an empty history
    fn polling_service(statuses: Vec<Option<&'static str>>) -> MockService {
        let calls = statuses.len();
        let mut remaining = statuses.into_iter();
        let mut service = MockService::new();
        service
            .expect_latest_refresh()
            .times(calls)
            .returning(move |_, _| Ok(remaining.next().flatten().map(record)));
        service
    }

    #[test]
    fn test_validate_parameters_accepts_complete_input() {
        assert!(validate_parameters(&credentials(), &target(), &objects()).is_ok());
    }

    #[test]
    fn test_validate_parameters_names_each_missing_field() {
        let cases: Vec<(&str, OAuth2ClientConfig, DatasetTarget)> = vec![
            (
                "client_id",
                OAuth2ClientConfig::new("", "secret", "tenant"),
                target(),
            ),
            (
                "client_secret",
                OAuth2ClientConfig::new("id", "   ", "tenant"),
                target(),
            ),
            (
                "tenant_id",
                OAuth2ClientConfig::new("id", "secret", ""),
                target(),
            ),
            (
                "workspace_id",
                credentials(),
                DatasetTarget::new(" ", "dataset"),
            ),
            ("dataset_id", credentials(), DatasetTarget::new("ws", "")),
        ];

        for (field, creds, target) in cases {
            match validate_parameters(&creds, &target, &objects()).unwrap_err() {
                Error::Validation(msg) => assert!(msg.contains(field), "{}: {}", field, msg),
                other => panic!("Expected validation error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_validate_parameters_rejects_empty_objects() {
        let err = validate_parameters(&credentials(), &target(), &[]).unwrap_err();
        assert!(err.to_string().contains("refresh_objects"));

        let err = validate_parameters(
            &credentials(),
            &target(),
            &[RefreshObjectRef::table("Sales"), RefreshObjectRef::table("")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("refresh_objects[1].table"));
    }

    #[test]
    fn test_new_rejects_missing_credentials() {
        let result = RefreshCoordinator::new(
            OAuth2ClientConfig::new("", "", "tenant"),
            target(),
            objects(),
        );
        match result {
            Err(Error::Validation(msg)) => {
                assert!(msg.contains("client_id"));
                assert!(msg.contains("client_secret"));
            }
            _ => panic!("Expected validation error"),
        }
    }

    #[tokio::test]
    async fn test_authenticate_requests_powerbi_scope() {
        let mut auth = MockAuth::new();
        auth.expect_get_token()
            .withf(|scope| scope == POWERBI_SCOPE)
            .times(1)
            .returning(|_| Ok(AccessToken::new("token")));

        let mut coordinator = RefreshCoordinator::with_services(
            credentials(),
            target(),
            objects(),
            Arc::new(auth),
            Arc::new(MockService::new()),
        )
        .unwrap();

        assert!(!coordinator.is_authenticated());
        coordinator.authenticate().await.unwrap();
        assert!(coordinator.is_authenticated());
    }

    #[tokio::test]
    async fn test_authenticate_failure_is_auth_error() {
        let mut auth = MockAuth::new();
        auth.expect_get_token()
            .returning(|_| Err(Error::Auth("Failed to acquire token: Unknown error".to_string())));

        let mut coordinator = RefreshCoordinator::with_services(
            credentials(),
            target(),
            objects(),
            Arc::new(auth),
            Arc::new(MockService::new()),
        )
        .unwrap();

        assert!(matches!(
            coordinator.authenticate().await.unwrap_err(),
            Error::Auth(_)
        ));
        assert!(!coordinator.is_authenticated());
    }

    #[tokio::test]
    async fn test_authenticate_rejects_blank_token() {
        let mut auth = MockAuth::new();
        auth.expect_get_token()
            .returning(|_| Ok(AccessToken::new("")));

        let mut coordinator = RefreshCoordinator::with_services(
            credentials(),
            target(),
            objects(),
            Arc::new(auth),
            Arc::new(MockService::new()),
        )
        .unwrap();

        assert!(matches!(
            coordinator.authenticate().await.unwrap_err(),
            Error::Auth(_)
        ));
    }

    #[tokio::test]
    async fn test_trigger_before_authenticate_is_invalid_state() {
        let coordinator = RefreshCoordinator::with_services(
            credentials(),
            target(),
            objects(),
            Arc::new(MockAuth::new()),
            Arc::new(MockService::new()),
        )
        .unwrap();

        assert!(matches!(
            coordinator.trigger_refresh().await.unwrap_err(),
            Error::InvalidState(_)
        ));
        assert!(matches!(
            coordinator
                .await_completion(Duration::from_secs(1))
                .await
                .unwrap_err(),
            Error::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn test_trigger_sends_objects_in_order() {
        let captured: Arc<Mutex<Vec<RefreshRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);

        let mut service = MockService::new();
        service
            .expect_trigger_refresh()
            .withf(|token, _| token.secret() == "token")
            .times(1)
            .returning(move |_, request| {
                sink.lock().unwrap().push(request.clone());
                Ok(())
            });

        let coordinator = authenticated(service).await;
        coordinator.trigger_refresh().await.unwrap();

        let requests = captured.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].objects, objects());
        assert_eq!(requests[0].target, target());
        assert_eq!(requests[0].refresh_type, "Full");
        assert_eq!(requests[0].commit_mode, "transactional");
        assert_eq!(requests[0].max_parallelism, 2);
        assert_eq!(requests[0].retry_count, 2);
        assert_eq!(requests[0].timeout, Duration::from_secs(7200));
    }

    #[tokio::test]
    async fn test_trigger_twice_issues_two_requests() {
        let mut service = MockService::new();
        service
            .expect_trigger_refresh()
            .times(2)
            .returning(|_, _| Ok(()));

        let coordinator = authenticated(service).await;
        coordinator.trigger_refresh().await.unwrap();
        coordinator.trigger_refresh().await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_failure_keeps_status() {
        for code in [400u16, 500] {
            let mut service = MockService::new();
            service.expect_trigger_refresh().returning(move |_, _| {
                Err(Error::Trigger {
                    status: code,
                    body: "rejected".to_string(),
                })
            });

            let coordinator = authenticated(service).await;
            match coordinator.trigger_refresh().await.unwrap_err() {
                Error::Trigger { status, body } => {
                    assert_eq!(status, code);
                    assert_eq!(body, "rejected");
                }
                other => panic!("Expected trigger error, got {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_completed() {
        let service = polling_service(vec![
            Some("InProgress"),
            Some("InProgress"),
            Some("Completed"),
        ]);
        let coordinator = authenticated(service).await;

        let interval = Duration::from_secs(10);
        let before = Instant::now();
        let outcome = coordinator.await_completion(interval).await.unwrap();

        // Three polls with two sleeps in between
        let waited = before.elapsed();
        assert!(waited >= interval * 2 && waited < interval * 2 + Duration::from_millis(50));
        assert_eq!(outcome.status.as_str(), "Completed");
        assert!(outcome.is_success());
        assert!((outcome.duration_seconds - 20.0).abs() < 0.05);
        assert!(outcome.ended_at >= outcome.started_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_history_keeps_polling() {
        let service = polling_service(vec![None, Some("unknown"), Some("Failed")]);
        let coordinator = authenticated(service).await;

        let interval = Duration::from_secs(5);
        let before = Instant::now();
        let outcome = coordinator.await_completion(interval).await.unwrap();

        let waited = before.elapsed();
        assert!(waited >= interval * 2 && waited < interval * 3);
        assert_eq!(outcome.status.as_str(), "Failed");
        assert!(!outcome.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_status_returned_verbatim() {
        for raw in ["Disabled", "Cancelled", "completed", "SomethingNew"] {
            let service = polling_service(vec![Some(raw)]);
            let coordinator = authenticated(service).await;

            let outcome = coordinator
                .await_completion(Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(outcome.status.as_str(), raw);
            assert!(outcome.duration_seconds < 0.05);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_carries_failure_details() {
        let mut service = MockService::new();
        service.expect_latest_refresh().times(1).returning(|_, _| {
            Ok(Some(RefreshRecord {
                request_id: Some("req-42".to_string()),
                status: RefreshStatus::new("Failed"),
                service_exception_json: Some(r#"{"errorCode":"ModelRefreshFailed"}"#.to_string()),
                ..Default::default()
            }))
        });
        let coordinator = authenticated(service).await;

        let outcome = coordinator
            .await_completion(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.request_id.as_deref(), Some("req-42"));
        assert!(outcome
            .service_exception_json
            .unwrap()
            .contains("ModelRefreshFailed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_check_error_stops_polling() {
        let mut service = MockService::new();
        let mut calls = 0;
        service
            .expect_latest_refresh()
            .times(2)
            .returning(move |_, _| {
                calls += 1;
                if calls == 1 {
                    Ok(Some(record("InProgress")))
                } else {
                    Err(Error::StatusCheck {
                        status: 500,
                        body: "boom".to_string(),
                    })
                }
            });
        let coordinator = authenticated(service).await;

        match coordinator
            .await_completion(Duration::from_secs(1))
            .await
            .unwrap_err()
        {
            Error::StatusCheck { status, .. } => assert_eq!(status, 500),
            other => panic!("Expected status check error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let coordinator = authenticated(MockService::new()).await;
        assert!(matches!(
            coordinator.await_completion(Duration::ZERO).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_times_out() {
        let mut service = MockService::new();
        service
            .expect_latest_refresh()
            .times(4)
            .returning(|_, _| Ok(Some(record("InProgress"))));
        let coordinator = authenticated(service).await;

        let result = coordinator
            .await_completion_within(Duration::from_secs(10), Duration::from_secs(30))
            .await;
        match result.unwrap_err() {
            Error::Timeout(msg) => assert!(msg.contains("InProgress")),
            other => panic!("Expected timeout error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_shorter_than_interval_is_honoured() {
        let mut service = MockService::new();
        service
            .expect_latest_refresh()
            .times(2)
            .returning(|_, _| Ok(Some(record("InProgress"))));
        let coordinator = authenticated(service).await;

        let max_wait = Duration::from_secs(5);
        let started = Instant::now();
        let result = coordinator
            .await_completion_within(Duration::from_secs(600), max_wait)
            .await;
        let waited = started.elapsed();

        assert!(matches!(result.unwrap_err(), Error::Timeout(_)));
        assert!(waited >= max_wait, "waited {:?}", waited);
        assert!(waited < max_wait + Duration::from_millis(50), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_executes_full_workflow() {
        let mut service = polling_service(vec![Some("InProgress"), Some("Completed")]);
        service
            .expect_trigger_refresh()
            .times(1)
            .returning(|_, _| Ok(()));

        let mut coordinator = RefreshCoordinator::with_services(
            credentials(),
            target(),
            objects(),
            Arc::new(authorized()),
            Arc::new(service),
        )
        .unwrap();

        let outcome = coordinator
            .run(Duration::from_secs(2), None)
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert!(coordinator.is_authenticated());
    }
}
