//! REST collaborator
//!
//! The engine only needs success or failure from these calls; the state
//! change they cause arrives later over the channel.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::WorkerOptions;
use crate::error::ApiError;
use crate::types::{
    attributes_from_value, Activity, ReservationPayload, ReservationStatus, Sid, StateSnapshot,
    TaskPayload, TaskStatus,
};

/// Backend operations a worker issues
#[async_trait]
pub trait TaskRouterApi: Send + Sync {
    async fn accept_reservation(&self, reservation_sid: &Sid) -> Result<(), ApiError>;

    async fn reject_reservation(
        &self,
        reservation_sid: &Sid,
        activity_sid: Option<&Sid>,
    ) -> Result<(), ApiError>;

    async fn complete_task(&self, task_sid: &Sid, reason: &str) -> Result<(), ApiError>;

    async fn wrapup_task(&self, task_sid: &Sid, reason: &str) -> Result<(), ApiError>;

    async fn update_worker_activity(&self, activity_sid: &Sid) -> Result<(), ApiError>;

    /// Full worker state, fetched whenever the channel (re)opens.
    async fn fetch_state(&self) -> Result<StateSnapshot, ApiError>;
}

/// Statuses a worker still tracks after a (re)connect
const ACTIVE_RESERVATION_STATUSES: &str = "pending,accepted,wrapping";

/// HTTP implementation of [`TaskRouterApi`]
pub struct HttpApi {
    client: reqwest::Client,
    workspace_url: String,
    worker_sid: Sid,
    token: String,
}

#[derive(Debug, Deserialize)]
struct WorkerResource {
    #[serde(default)]
    activity_sid: Option<Sid>,
    #[serde(default)]
    activity_name: Option<String>,
    #[serde(default)]
    available: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ReservationPage {
    #[serde(default)]
    reservations: Vec<ReservationResource>,
}

#[derive(Debug, Deserialize)]
struct ReservationResource {
    sid: Sid,
    reservation_status: ReservationStatus,
    task_sid: Sid,
    #[serde(default)]
    task: Option<TaskResource>,
}

#[derive(Debug, Deserialize)]
struct TaskResource {
    #[serde(default)]
    assignment_status: Option<TaskStatus>,
    #[serde(default)]
    attributes: Option<serde_json::Value>,
    #[serde(default)]
    queue_sid: Option<Sid>,
    #[serde(default)]
    workflow_sid: Option<Sid>,
    #[serde(default)]
    task_channel_unique_name: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    age: Option<u64>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    timeout: Option<u64>,
}

impl ReservationResource {
    fn into_payload(self) -> Result<ReservationPayload, ApiError> {
        let task = match self.task {
            Some(t) => TaskPayload {
                sid: Some(self.task_sid),
                status: t.assignment_status,
                reason: t.reason,
                attributes: t
                    .attributes
                    .map(attributes_from_value)
                    .transpose()
                    .map_err(ApiError::Decode)?,
                queue_sid: t.queue_sid,
                workflow_sid: t.workflow_sid,
                task_channel_unique_name: t.task_channel_unique_name,
                age: t.age,
                priority: t.priority,
                timeout: t.timeout,
            },
            None => TaskPayload {
                sid: Some(self.task_sid),
                ..Default::default()
            },
        };
        Ok(ReservationPayload {
            sid: self.sid,
            status: self.reservation_status,
            task,
        })
    }
}

impl HttpApi {
    pub fn new(options: &WorkerOptions) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .timeout(Duration::from_millis(options.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            workspace_url: format!(
                "{}/v1/Workspaces/{}",
                options.api_base_url.trim_end_matches('/'),
                options.workspace_sid
            ),
            worker_sid: Sid::from(options.worker_sid.as_str()),
            token: options.token.clone(),
        })
    }

    fn worker_url(&self) -> String {
        format!("{}/Workers/{}", self.workspace_url, self.worker_sid)
    }

    fn reservation_url(&self, reservation_sid: &Sid) -> String {
        format!("{}/Reservations/{}", self.worker_url(), reservation_sid)
    }

    fn task_url(&self, task_sid: &Sid) -> String {
        format!("{}/Tasks/{}", self.workspace_url, task_sid)
    }

    async fn post_form(&self, url: String, form: &[(&str, &str)]) -> Result<(), ApiError> {
        debug!(url = %url, "POST");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .form(form)
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl TaskRouterApi for HttpApi {
    async fn accept_reservation(&self, reservation_sid: &Sid) -> Result<(), ApiError> {
        self.post_form(
            self.reservation_url(reservation_sid),
            &[("ReservationStatus", ReservationStatus::Accepted.as_str())],
        )
        .await
    }

    async fn reject_reservation(
        &self,
        reservation_sid: &Sid,
        activity_sid: Option<&Sid>,
    ) -> Result<(), ApiError> {
        let mut form = vec![("ReservationStatus", ReservationStatus::Rejected.as_str())];
        if let Some(activity) = activity_sid {
            form.push(("WorkerActivitySid", activity.as_str()));
        }
        self.post_form(self.reservation_url(reservation_sid), &form)
            .await
    }

    async fn complete_task(&self, task_sid: &Sid, reason: &str) -> Result<(), ApiError> {
        self.post_form(
            self.task_url(task_sid),
            &[
                ("AssignmentStatus", TaskStatus::Completed.as_str()),
                ("Reason", reason),
            ],
        )
        .await
    }

    async fn wrapup_task(&self, task_sid: &Sid, reason: &str) -> Result<(), ApiError> {
        self.post_form(
            self.task_url(task_sid),
            &[
                ("AssignmentStatus", TaskStatus::Wrapping.as_str()),
                ("Reason", reason),
            ],
        )
        .await
    }

    async fn update_worker_activity(&self, activity_sid: &Sid) -> Result<(), ApiError> {
        self.post_form(self.worker_url(), &[("ActivitySid", activity_sid.as_str())])
            .await
    }

    async fn fetch_state(&self) -> Result<StateSnapshot, ApiError> {
        let worker: WorkerResource = self.get_json(self.worker_url(), &[]).await?;
        let page: ReservationPage = self
            .get_json(
                format!("{}/Reservations", self.worker_url()),
                &[
                    ("ReservationStatus", ACTIVE_RESERVATION_STATUSES),
                    ("Expand", "task"),
                ],
            )
            .await?;

        let activity = worker.activity_sid.map(|sid| Activity {
            sid,
            name: worker.activity_name.unwrap_or_default(),
            available: worker.available.unwrap_or(false),
        });
        let reservations = page
            .reservations
            .into_iter()
            .map(ReservationResource::into_payload)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StateSnapshot {
            activity,
            reservations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options() -> WorkerOptions {
        WorkerOptions {
            api_base_url: "https://api.example.com/".into(),
            workspace_sid: "WS1".into(),
            worker_sid: "WK1".into(),
            token: "t".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_urls() {
        let api = HttpApi::new(&options()).unwrap();
        assert_eq!(api.worker_url(), "https://api.example.com/v1/Workspaces/WS1/Workers/WK1");
        assert_eq!(
            api.reservation_url(&Sid::from("WR1")),
            "https://api.example.com/v1/Workspaces/WS1/Workers/WK1/Reservations/WR1"
        );
        assert_eq!(
            api.task_url(&Sid::from("WT1")),
            "https://api.example.com/v1/Workspaces/WS1/Tasks/WT1"
        );
    }

    #[test]
    fn test_reservation_resource_into_payload() {
        let resource: ReservationResource = serde_json::from_value(json!({
            "sid": "WR1",
            "reservation_status": "accepted",
            "task_sid": "WT1",
            "task": {
                "assignment_status": "assigned",
                "attributes": "{\"selected_language\":\"es\"}",
                "queue_sid": "WQ1"
            }
        }))
        .unwrap();

        let payload = resource.into_payload().unwrap();
        assert_eq!(payload.status, ReservationStatus::Accepted);
        assert_eq!(payload.task.sid, Some(Sid::from("WT1")));
        assert_eq!(payload.task.status, Some(TaskStatus::Assigned));
        assert_eq!(payload.task.attributes.unwrap()["selected_language"], json!("es"));
    }
}
