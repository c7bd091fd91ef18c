//! Native queue service.
//!
//! Queues live in the tenant store, one map per (account, region). Messages
//! are held in memory with a visibility deadline; receives can long-poll.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use stratus_core::{Params, ServiceError, TenantContext, Value};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::service::dispatch::{DispatchTable, HandlerError, Invocation};
use crate::storage::{AccountRegionStore, Attribute, TenantState};
use crate::traits::{ServiceContext, ServiceProvider};

static QUEUES: Attribute<DashMap<String, Arc<Queue>>> = Attribute::local("queues", DashMap::new);

const DEFAULT_VISIBILITY_TIMEOUT_SECS: i64 = 30;
const MAX_VISIBILITY_TIMEOUT_SECS: i64 = 43_200;
const MAX_DELAY_SECS: i64 = 900;
const MAX_WAIT_SECS: i64 = 20;
const MAX_RECEIVE: i64 = 10;
const MAX_QUEUE_NAME_LEN: usize = 80;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Message {
    id: String,
    body: String,
    visible_at: Instant,
    receipt: Option<String>,
}

#[derive(Debug)]
struct Queue {
    url: String,
    arn: String,
    created: DateTime<Utc>,
    attributes: RwLock<BTreeMap<String, String>>,
    messages: Mutex<VecDeque<Message>>,
    arrived: Notify,
}

impl Queue {
    fn attribute_secs(&self, name: &str, default: i64) -> i64 {
        self.attributes
            .read()
            .get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Hands out up to `max` visible messages and hides them for `visibility`.
    fn take_visible(&self, max: usize, visibility: Duration) -> Vec<Params> {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(max)
            .map(|m| {
                let receipt = uuid::Uuid::new_v4().to_string();
                m.visible_at = now + visibility;
                m.receipt = Some(receipt.clone());
                Params::from([
                    ("MessageId".to_string(), Value::String(m.id.clone())),
                    ("ReceiptHandle".to_string(), Value::String(receipt)),
                    ("Body".to_string(), Value::String(m.body.clone())),
                ])
            })
            .collect()
    }

    fn counts(&self) -> (usize, usize) {
        let now = Instant::now();
        let messages = self.messages.lock();
        let visible = messages.iter().filter(|m| m.visible_at <= now).count();
        (visible, messages.len() - visible)
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// In-memory queue emulation.
#[derive(Debug)]
pub struct SqsProvider {
    store: AccountRegionStore,
    endpoint_url: String,
}

/// Factory registered as the default `sqs` variant.
///
/// # Errors
///
/// Never fails.
pub fn factory(ctx: &ServiceContext) -> anyhow::Result<Arc<dyn ServiceProvider>> {
    Ok(Arc::new(SqsProvider::new(ctx)))
}

#[async_trait]
impl ServiceProvider for SqsProvider {
    fn dispatch_table(self: Arc<Self>) -> DispatchTable {
        DispatchTable::builder("sqs")
            .route("CreateQueue", &self, |p, inv| async move { p.create_queue(&inv) })
            .route("GetQueueUrl", &self, |p, inv| async move { p.get_queue_url(&inv) })
            .route("ListQueues", &self, |p, inv| async move { p.list_queues(&inv) })
            .route("DeleteQueue", &self, |p, inv| async move { p.delete_queue(&inv) })
            .route("GetQueueAttributes", &self, |p, inv| async move {
                p.get_queue_attributes(&inv)
            })
            .route("SendMessage", &self, |p, inv| async move { p.send_message(&inv) })
            .route("ReceiveMessage", &self, |p, inv| async move { p.receive_message(inv).await })
            .route("DeleteMessage", &self, |p, inv| async move { p.delete_message(&inv) })
            .build()
    }

    async fn reset_state(&self) -> anyhow::Result<()> {
        self.store.reset();
        Ok(())
    }
}

impl SqsProvider {
    #[must_use]
    pub fn new(ctx: &ServiceContext) -> Self {
        Self {
            store: ctx.new_store(),
            endpoint_url: ctx.config.endpoint_url.trim_end_matches('/').to_string(),
        }
    }

    fn tenant(&self, ctx: &TenantContext) -> Result<Arc<TenantState>, HandlerError> {
        Ok(self.store.get(&ctx.account_id, &ctx.region)?)
    }

    /// Queue addressed by the `QueueUrl` member. Only the last path segment
    /// is significant.
    fn queue(&self, inv: &Invocation) -> Result<Arc<Queue>, HandlerError> {
        let url = required(&inv.params, "QueueUrl")?;
        let name = url.trim_end_matches('/').rsplit('/').next().unwrap_or(url);
        let queues = self.tenant(&inv.ctx)?.get(&QUEUES);
        let queue = queues.get(name).map(|q| Arc::clone(q.value()));
        queue.ok_or_else(|| not_found(&inv.ctx).into())
    }

    fn create_queue(&self, inv: &Invocation) -> Result<Params, HandlerError> {
        let name = required(&inv.params, "QueueName")?;
        validate_queue_name(name)?;
        let attributes = string_map(&inv.params, "Attributes");
        validate_attributes(&attributes)?;

        let queues = self.tenant(&inv.ctx)?.get(&QUEUES);
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(account_id = %inv.ctx.account_id, region = %inv.ctx.region, queue = name, "creating queue");
                Arc::new(Queue {
                    url: format!("{}/{}/{name}", self.endpoint_url, inv.ctx.account_id),
                    arn: inv.ctx.arn(name),
                    created: Utc::now(),
                    attributes: RwLock::new(attributes.clone()),
                    messages: Mutex::new(VecDeque::new()),
                    arrived: Notify::new(),
                })
            })
            .value()
            .clone();

        let existing = queue.attributes.read();
        if attributes.iter().any(|(k, v)| existing.get(k) != Some(v)) {
            return Err(ServiceError::from_model(
                &inv.ctx.service,
                "QueueNameExists",
                format!("A queue already exists with the same name and a different value for attribute(s) of {name}"),
            )
            .into());
        }
        Ok(url_output(&queue.url))
    }

    fn get_queue_url(&self, inv: &Invocation) -> Result<Params, HandlerError> {
        let name = required(&inv.params, "QueueName")?;
        let owner = optional_str(&inv.params, "QueueOwnerAWSAccountId").unwrap_or(&inv.ctx.account_id);
        let tenant = self.store.get(owner, &inv.ctx.region)?;
        let queues = tenant.get(&QUEUES);
        let queue = queues.get(name).ok_or_else(|| not_found(&inv.ctx))?;
        Ok(url_output(&queue.url))
    }

    fn list_queues(&self, inv: &Invocation) -> Result<Params, HandlerError> {
        let prefix = optional_str(&inv.params, "QueueNamePrefix").unwrap_or("");
        let limit = match optional_int(&inv.params, "MaxResults") {
            Some(n @ 1..=1000) => usize::try_from(n).unwrap_or(1000),
            Some(n) => return Err(invalid(format!("MaxResults must be between 1 and 1000, got {n}"))),
            None => 1000,
        };
        let queues = self.tenant(&inv.ctx)?.get(&QUEUES);
        let mut urls: Vec<(String, String)> = queues
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().url.clone()))
            .collect();
        urls.sort_unstable();
        let urls: Vec<Value> = urls.into_iter().take(limit).map(|(_, url)| Value::String(url)).collect();

        let mut output = Params::new();
        if !urls.is_empty() {
            output.insert("QueueUrls".to_string(), Value::List(urls));
        }
        Ok(output)
    }

    fn delete_queue(&self, inv: &Invocation) -> Result<Params, HandlerError> {
        let queue = self.queue(inv)?;
        let queues = self.tenant(&inv.ctx)?.get(&QUEUES);
        queues.retain(|_, q| !Arc::ptr_eq(q, &queue));
        Ok(Params::new())
    }

    fn get_queue_attributes(&self, inv: &Invocation) -> Result<Params, HandlerError> {
        let queue = self.queue(inv)?;
        let (visible, in_flight) = queue.counts();

        let mut all = queue.attributes.read().clone();
        all.entry("VisibilityTimeout".to_string())
            .or_insert_with(|| DEFAULT_VISIBILITY_TIMEOUT_SECS.to_string());
        all.entry("DelaySeconds".to_string()).or_insert_with(|| "0".to_string());
        all.insert("QueueArn".to_string(), queue.arn.clone());
        all.insert("CreatedTimestamp".to_string(), queue.created.timestamp().to_string());
        all.insert("ApproximateNumberOfMessages".to_string(), visible.to_string());
        all.insert("ApproximateNumberOfMessagesNotVisible".to_string(), in_flight.to_string());

        let requested: Vec<&str> = inv
            .params
            .get("AttributeNames")
            .and_then(Value::as_list)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if !requested.is_empty() && !requested.contains(&"All") {
            all.retain(|k, _| requested.contains(&k.as_str()));
        }

        let attributes = all.into_iter().map(|(k, v)| (k, Value::String(v))).collect::<Params>();
        Ok(Params::from([("Attributes".to_string(), Value::Map(attributes))]))
    }

    fn send_message(&self, inv: &Invocation) -> Result<Params, HandlerError> {
        let queue = self.queue(inv)?;
        let body = required(&inv.params, "MessageBody")?;
        if body.is_empty() {
            return Err(invalid("The request must contain the parameter MessageBody."));
        }
        let delay = optional_int(&inv.params, "DelaySeconds")
            .unwrap_or_else(|| queue.attribute_secs("DelaySeconds", 0));
        let delay = secs_in_range("DelaySeconds", delay, MAX_DELAY_SECS)?;

        let id = uuid::Uuid::new_v4().to_string();
        queue.messages.lock().push_back(Message {
            id: id.clone(),
            body: body.to_string(),
            visible_at: Instant::now() + delay,
            receipt: None,
        });
        queue.arrived.notify_waiters();
        Ok(Params::from([("MessageId".to_string(), Value::String(id))]))
    }

    async fn receive_message(&self, inv: Invocation) -> Result<Params, HandlerError> {
        let queue = self.queue(&inv)?;
        let max = optional_int(&inv.params, "MaxNumberOfMessages").unwrap_or(1);
        if !(1..=MAX_RECEIVE).contains(&max) {
            return Err(invalid(format!(
                "Value {max} for parameter MaxNumberOfMessages is invalid. Reason: Must be between 1 and {MAX_RECEIVE}."
            )));
        }
        let max = usize::try_from(max).unwrap_or(1);
        let visibility = optional_int(&inv.params, "VisibilityTimeout")
            .unwrap_or_else(|| queue.attribute_secs("VisibilityTimeout", DEFAULT_VISIBILITY_TIMEOUT_SECS));
        let visibility = secs_in_range("VisibilityTimeout", visibility, MAX_VISIBILITY_TIMEOUT_SECS)?;
        let wait = optional_int(&inv.params, "WaitTimeSeconds")
            .unwrap_or_else(|| queue.attribute_secs("ReceiveMessageWaitTimeSeconds", 0));
        let wait = secs_in_range("WaitTimeSeconds", wait, MAX_WAIT_SECS)?;

        let deadline = Instant::now() + wait;
        let messages = loop {
            // Registered before the check so a send in between is not missed.
            let arrived = queue.arrived.notified();
            let batch = queue.take_visible(max, visibility);
            if !batch.is_empty() || Instant::now() >= deadline {
                break batch;
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                break queue.take_visible(max, visibility);
            }
        };

        let mut output = Params::new();
        if !messages.is_empty() {
            let messages = messages.into_iter().map(Value::Map).collect();
            output.insert("Messages".to_string(), Value::List(messages));
        }
        Ok(output)
    }

    fn delete_message(&self, inv: &Invocation) -> Result<Params, HandlerError> {
        let queue = self.queue(inv)?;
        let handle = required(&inv.params, "ReceiptHandle")?;
        let mut messages = queue.messages.lock();
        let Some(index) = messages.iter().position(|m| m.receipt.as_deref() == Some(handle)) else {
            return Err(ServiceError::from_model(
                &inv.ctx.service,
                "ReceiptHandleIsInvalid",
                format!("The input receipt handle \"{handle}\" is not a valid receipt handle."),
            )
            .into());
        };
        messages.remove(index);
        Ok(Params::new())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn invalid(message: impl Into<String>) -> HandlerError {
    ServiceError::new("InvalidParameterValue", message).into()
}

fn not_found(ctx: &TenantContext) -> ServiceError {
    ServiceError::from_model(&ctx.service, "QueueDoesNotExist", "The specified queue does not exist.")
}

fn url_output(url: &str) -> Params {
    Params::from([("QueueUrl".to_string(), Value::String(url.to_string()))])
}

fn optional_str<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
    params.get(name).and_then(Value::as_str)
}

fn optional_int(params: &Params, name: &str) -> Option<i64> {
    params.get(name).and_then(Value::as_i64)
}

fn required<'a>(params: &'a Params, name: &str) -> Result<&'a str, HandlerError> {
    optional_str(params, name).ok_or_else(|| {
        ServiceError::new("MissingParameter", format!("The request must contain the parameter {name}.")).into()
    })
}

fn string_map(params: &Params, name: &str) -> BTreeMap<String, String> {
    params
        .get(name)
        .and_then(Value::as_map)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn secs_in_range(name: &str, secs: i64, max: i64) -> Result<Duration, HandlerError> {
    if !(0..=max).contains(&secs) {
        return Err(invalid(format!(
            "Value {secs} for parameter {name} is invalid. Reason: Must be between 0 and {max}."
        )));
    }
    Ok(Duration::from_secs(secs.unsigned_abs()))
}

fn validate_queue_name(name: &str) -> Result<(), HandlerError> {
    let base = name.strip_suffix(".fifo").unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && base.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(invalid(
            "Can only include alphanumeric characters, hyphens, or underscores. 1 to 80 in length",
        ))
    }
}

fn validate_attributes(attributes: &BTreeMap<String, String>) -> Result<(), HandlerError> {
    let bounds = [
        ("VisibilityTimeout", MAX_VISIBILITY_TIMEOUT_SECS),
        ("DelaySeconds", MAX_DELAY_SECS),
        ("ReceiveMessageWaitTimeSeconds", MAX_WAIT_SECS),
    ];
    for (name, max) in bounds {
        if let Some(raw) = attributes.get(name) {
            let secs = raw
                .parse::<i64>()
                .map_err(|_| invalid(format!("Invalid value for the parameter {name}.")))?;
            secs_in_range(name, secs, max)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
