//! Ordered handler chain executed once per request.
//!
//! Four lists run in sequence: request handlers, response handlers on
//! success, exception handlers when anything failed, and finalizers always.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::StatusCode;
use tokio::sync::broadcast;

use super::context::RequestContext;
use crate::codec::EncodedResponse;
use crate::service::{GatewayError, INTERNAL_ERROR_MESSAGE};

/// Capacity of the chain event channel. Slow subscribers lag, they never
/// block requests.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// One step of the chain.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Name reported in chain events and logs.
    fn name(&self) -> &'static str;

    /// Runs the step.
    ///
    /// # Errors
    ///
    /// Any error moves the request into the exception phase. Errors of
    /// exception handlers and finalizers are logged and dropped.
    async fn handle(&self, ctx: &mut RequestContext, control: &mut ChainControl) -> Result<(), GatewayError>;
}

/// Per-request control state shared by the handlers of one run.
#[derive(Debug, Default)]
pub struct ChainControl {
    response: Option<EncodedResponse>,
    error: Option<GatewayError>,
}

impl ChainControl {
    /// Answers the request immediately. Remaining request handlers are
    /// skipped; response handlers and finalizers still run.
    pub fn respond(&mut self, response: EncodedResponse) {
        self.response = Some(response);
    }

    #[must_use]
    pub fn responded(&self) -> bool {
        self.response.is_some()
    }

    /// The error being handled, during the exception phase.
    #[must_use]
    pub fn error(&self) -> Option<&GatewayError> {
        self.error.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Chain phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Request,
    Response,
    Exception,
    Finalizer,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Exception => "exception",
            Self::Finalizer => "finalizer",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Before,
    After,
}

/// Emitted around every handler invocation.
#[derive(Debug, Clone)]
pub struct ChainEvent {
    pub request_id: String,
    pub phase: Phase,
    pub handler: &'static str,
    pub stage: Stage,
    /// Time since the request entered the chain.
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// HandlerChain
// ---------------------------------------------------------------------------

/// Statically ordered handler lists shared by every request.
pub struct HandlerChain {
    request: Vec<Arc<dyn Handler>>,
    response: Vec<Arc<dyn Handler>>,
    exception: Vec<Arc<dyn Handler>>,
    finalizers: Vec<Arc<dyn Handler>>,
    events: broadcast::Sender<ChainEvent>,
}

impl HandlerChain {
    #[must_use]
    pub fn builder() -> HandlerChainBuilder {
        HandlerChainBuilder::default()
    }

    /// Receives chain events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Runs the whole chain and returns the response to send.
    ///
    /// Never fails: when no handler produced a response a bare 500 is
    /// returned.
    pub async fn run(&self, ctx: &mut RequestContext) -> EncodedResponse {
        let entered = Instant::now();
        let mut control = ChainControl::default();

        for handler in &self.request {
            if control.responded() {
                break;
            }
            if let Err(e) = self.step(Phase::Request, handler, ctx, &mut control, entered).await {
                control.error = Some(e);
                break;
            }
        }
        if let Some(response) = control.response.take() {
            ctx.set_response(response);
        }

        if control.error.is_none() {
            for handler in &self.response {
                if let Err(e) = self.step(Phase::Response, handler, ctx, &mut control, entered).await {
                    control.error = Some(e);
                    break;
                }
            }
        }

        if control.error.is_some() {
            for handler in &self.exception {
                if let Err(e) = self.step(Phase::Exception, handler, ctx, &mut control, entered).await {
                    tracing::warn!(
                        request_id = %ctx.request_id(),
                        handler = handler.name(),
                        error = %e,
                        "exception handler failed"
                    );
                }
            }
        }

        for handler in &self.finalizers {
            if let Err(e) = self.step(Phase::Finalizer, handler, ctx, &mut control, entered).await {
                tracing::warn!(
                    request_id = %ctx.request_id(),
                    handler = handler.name(),
                    error = %e,
                    "finalizer failed"
                );
            }
        }

        ctx.take_response().unwrap_or_else(|| {
            tracing::warn!(request_id = %ctx.request_id(), "chain produced no response");
            EncodedResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain; charset=utf-8",
                INTERNAL_ERROR_MESSAGE,
            )
        })
    }

    async fn step(
        &self,
        phase: Phase,
        handler: &Arc<dyn Handler>,
        ctx: &mut RequestContext,
        control: &mut ChainControl,
        entered: Instant,
    ) -> Result<(), GatewayError> {
        self.emit(ctx.request_id(), phase, handler.name(), Stage::Before, entered);
        let result = handler.handle(ctx, control).await;
        self.emit(ctx.request_id(), phase, handler.name(), Stage::After, entered);
        result
    }

    fn emit(&self, request_id: &str, phase: Phase, handler: &'static str, stage: Stage, entered: Instant) {
        let elapsed = entered.elapsed();
        tracing::debug!(
            request_id,
            phase = %phase,
            handler,
            stage = ?stage,
            elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            "chain"
        );
        if self.events.receiver_count() > 0 {
            // No receivers left between the check and the send is fine.
            let _ = self.events.send(ChainEvent {
                request_id: request_id.to_string(),
                phase,
                handler,
                stage,
                elapsed,
            });
        }
    }
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |list: &[Arc<dyn Handler>]| list.iter().map(|h| h.name()).collect::<Vec<_>>();
        f.debug_struct("HandlerChain")
            .field("request", &names(&self.request))
            .field("response", &names(&self.response))
            .field("exception", &names(&self.exception))
            .field("finalizers", &names(&self.finalizers))
            .finish()
    }
}

/// Assembles a [`HandlerChain`]; handlers run in the order they are added.
#[derive(Default)]
pub struct HandlerChainBuilder {
    request: Vec<Arc<dyn Handler>>,
    response: Vec<Arc<dyn Handler>>,
    exception: Vec<Arc<dyn Handler>>,
    finalizers: Vec<Arc<dyn Handler>>,
}

impl HandlerChainBuilder {
    #[must_use]
    pub fn request(mut self, handler: impl Handler + 'static) -> Self {
        self.request.push(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn response(mut self, handler: impl Handler + 'static) -> Self {
        self.response.push(Arc::new(handler));
        self
    }

    /// Adds an already shared handler to the response phase.
    #[must_use]
    pub fn response_shared(mut self, handler: Arc<dyn Handler>) -> Self {
        self.response.push(handler);
        self
    }

    #[must_use]
    pub fn exception(mut self, handler: impl Handler + 'static) -> Self {
        self.exception.push(Arc::new(handler));
        self
    }

    /// Adds an already shared handler to the exception phase.
    #[must_use]
    pub fn exception_shared(mut self, handler: Arc<dyn Handler>) -> Self {
        self.exception.push(handler);
        self
    }

    #[must_use]
    pub fn finalizer(mut self, handler: impl Handler + 'static) -> Self {
        self.finalizers.push(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn build(self) -> HandlerChain {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        HandlerChain {
            request: self.request,
            response: self.response,
            exception: self.exception,
            finalizers: self.finalizers,
            events,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
