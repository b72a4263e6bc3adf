//! `Worker` builder and serve loop.
//!
//! This is the entry point of one worker. It ties together all the layers:
//! shared listener → session middleware → realtime routes and application
//! routes → connection registry ← fan-out subscription.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use cohort_fanout::{
    Broadcaster, ConnectionRegistry, FanoutBus, MessageHandler, Subscription, SubscriptionEnd,
    attach_registry, dispatch_channel,
};
use cohort_protocol::{FanoutMessage, JsonCodec, WorkerId};
use futures_util::future::BoxFuture;
use cohort_session::{SessionAuthenticator, SessionStore};
use cohort_transport::{PollingHub, TransportError, TransportKind, WebSocketConnection, bind_shared};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;

use crate::boundary::{self, AppError, ErrorRenderer, HtmlErrorRenderer};
use crate::config::{ConfigError, WorkerConfig};
use crate::handler::handle_connection;
use crate::sessions::{Authenticated, Sessions};
use crate::{CohortError, middleware, polling};

/// State shared by the realtime routes and every connection task.
pub(crate) struct Realtime {
    pub(crate) worker_id: WorkerId,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) polling: Arc<PollingHub>,
    pub(crate) transports: Vec<TransportKind>,
    pub(crate) codec: JsonCodec,
    pub(crate) idle_timeout: Duration,
    pub(crate) poll_wait: Duration,
}

/// Builder for configuring and starting a worker.
///
/// # Example
///
/// ```rust,ignore
/// let worker = WorkerBuilder::new(config)
///     .worker_id(id)
///     .routes(app_routes)
///     .build(store, bus)
///     .await?;
/// worker.run().await
/// ```
pub struct WorkerBuilder {
    config: WorkerConfig,
    worker_id: WorkerId,
    routes: Router,
    renderer: Arc<dyn ErrorRenderer>,
    handlers: Vec<(String, Arc<dyn MessageHandler>)>,
}

impl WorkerBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            worker_id: WorkerId(0),
            routes: Router::new(),
            renderer: Arc::new(HtmlErrorRenderer),
            handlers: Vec::new(),
        }
    }

    /// Sets the id the supervisor gave this worker. Defaults to `W-0`
    /// for a worker running without a supervisor.
    pub fn worker_id(mut self, id: WorkerId) -> Self {
        self.worker_id = id;
        self
    }

    /// Application routes, served next to the realtime routes.
    ///
    /// They run behind the session middleware and can extract
    /// [`CurrentSession`](crate::CurrentSession), `Extension<Sessions<S>>`,
    /// `Extension<Broadcaster<B>>` and `Extension<Arc<CollaboratorConfig>>`.
    /// They must not set a fallback; unmatched requests belong to the
    /// error boundary.
    pub fn routes(mut self, routes: Router) -> Self {
        self.routes = routes;
        self
    }

    /// Replaces the default HTML error page.
    pub fn error_renderer(mut self, renderer: impl ErrorRenderer) -> Self {
        self.renderer = Arc::new(renderer);
        self
    }

    /// Subscribes `handler` to a broker channel when the worker starts.
    ///
    /// A panic in the handler is a fault outside any request: the worker
    /// stops with [`CohortError::Fatal`].
    pub fn on_message(mut self, channel: impl Into<String>, handler: impl MessageHandler) -> Self {
        self.handlers.push((channel.into(), Arc::new(handler)));
        self
    }

    /// Binds the shared port, subscribes to the broker and assembles the
    /// router.
    ///
    /// The returned future is `Send + 'static` whatever the store and bus,
    /// so callers can spawn it.
    ///
    /// # Errors
    /// - [`CohortError::Config`] when the session settings are incomplete
    /// - [`CohortError::Bind`] when the port cannot be bound
    /// - [`CohortError::Fanout`] when the broker refuses the subscription
    pub fn build<S: SessionStore, B: FanoutBus>(
        self,
        store: S,
        bus: B,
    ) -> BoxFuture<'static, Result<Worker<S, B>, CohortError>> {
        Box::pin(async move {
            let WorkerBuilder {
                config,
                worker_id,
                routes,
                renderer,
                handlers,
            } = self;

            config.session.validate().map_err(ConfigError::Missing)?;
            if config.transports.is_empty() {
                return Err(ConfigError::Missing("at least one transport").into());
            }
            let auth = SessionAuthenticator::new(store, config.session.clone())?;

            let port = config.addr.port();
            let listener = bind_shared(config.addr).map_err(|e| match e {
                TransportError::Bind { source, .. } => CohortError::bind(port, source),
                other => other.into(),
            })?;
            let local_addr = listener
                .local_addr()
                .map_err(|e| CohortError::bind(port, e))?;

            let registry = ConnectionRegistry::new();
            let channel = dispatch_channel(&config.channel_prefix);
            let mut subscriptions = vec![attach_registry(&bus, &channel, registry.clone()).await?];
            for (name, handler) in handlers {
                let subscription = bus
                    .subscribe(&name, move |message: FanoutMessage| handler.handle(message))
                    .await?;
                subscriptions.push(subscription);
            }

            let polling = Arc::new(PollingHub::new());
            let sweeper = Sweeper(tokio::spawn(polling::sweep(
                Arc::clone(&polling),
                config.poll_idle,
            )));

            let rt = Arc::new(Realtime {
                worker_id,
                registry: registry.clone(),
                polling,
                transports: config.transports.clone(),
                codec: JsonCodec,
                idle_timeout: config.idle_timeout,
                poll_wait: config.poll_wait,
            });
            let sessions = Sessions::new(auth.clone());
            let broadcaster = Broadcaster::new(bus, channel);
            let router = assemble_router(
                &config,
                rt,
                auth,
                sessions.clone(),
                broadcaster.clone(),
                routes,
                renderer,
            );

            tracing::info!(%worker_id, addr = %local_addr, transports = ?config.transports, "worker ready");
            Ok::<_, CohortError>(Worker {
                worker_id,
                local_addr,
                listener,
                router,
                sessions,
                broadcaster,
                registry,
                subscriptions,
                sweeper,
            })
        })
    }
}

fn assemble_router<S: SessionStore, B: FanoutBus>(
    config: &WorkerConfig,
    rt: Arc<Realtime>,
    auth: SessionAuthenticator<S>,
    sessions: Sessions<S>,
    broadcaster: Broadcaster<B>,
    routes: Router,
    renderer: Arc<dyn ErrorRenderer>,
) -> Router {
    let realtime = Router::new()
        .route("/realtime", get(upgrade))
        .route("/realtime/transports", get(transports))
        .route("/realtime/poll", post(polling::open))
        .route(
            "/realtime/poll/{sid}",
            get(polling::poll).post(polling::push).delete(polling::close),
        )
        .with_state(rt);

    let mut router = realtime
        .merge(routes)
        .method_not_allowed_fallback(boundary::not_found)
        .fallback(boundary::not_found)
        .layer(Extension(sessions))
        .layer(Extension(broadcaster))
        .layer(Extension(Arc::new(config.collaborators.clone())))
        .layer(from_fn_with_state(auth, middleware::authenticate::<S>))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::frame_options())
                .layer(middleware::xss_protection())
                .layer(from_fn_with_state(renderer, boundary::render_errors))
                .layer(CatchPanicLayer::custom(boundary::panic_response)),
        );

    if let Some(cors) = middleware::cors(&config.allowed_origins) {
        router = router.layer(cors);
    }
    if let Some(log) = middleware::request_log(config.production) {
        router = router.layer(log);
    }
    router
}

/// `GET /realtime`: WebSocket upgrade. Anonymous handshakes get 401.
async fn upgrade(
    State(rt): State<Arc<Realtime>>,
    Authenticated(session): Authenticated,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    if !rt.transports.contains(&TransportKind::WebSocket) {
        return Err(AppError::not_found());
    }
    Ok(ws
        .on_upgrade(move |socket| async move {
            let conn = WebSocketConnection::new(socket);
            if let Err(e) = handle_connection(conn, session, rt).await {
                tracing::debug!(error = %e, "connection ended with error");
            }
        })
        .into_response())
}

#[derive(Debug, Serialize)]
struct TransportList {
    transports: Vec<&'static str>,
}

/// `GET /realtime/transports`: enabled transports, preferred first.
async fn transports(State(rt): State<Arc<Realtime>>) -> Json<TransportList> {
    Json(TransportList {
        transports: rt.transports.iter().map(TransportKind::as_str).collect(),
    })
}

/// Aborts the polling sweeper when the worker goes away.
struct Sweeper(JoinHandle<()>);

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A bound, subscribed worker.
///
/// Call [`run()`](Self::run) to start serving.
pub struct Worker<S, B> {
    worker_id: WorkerId,
    local_addr: SocketAddr,
    listener: TcpListener,
    router: Router,
    sessions: Sessions<S>,
    broadcaster: Broadcaster<B>,
    registry: ConnectionRegistry,
    subscriptions: Vec<Subscription>,
    sweeper: Sweeper,
}

impl<S: SessionStore, B: FanoutBus> Worker<S, B> {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// The bound address (with the real port when bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The complete router, error boundary included.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn sessions(&self) -> &Sessions<S> {
        &self.sessions
    }

    /// Publishing handle for events to connections on any worker.
    pub fn broadcaster(&self) -> &Broadcaster<B> {
        &self.broadcaster
    }

    /// The connections held by this worker.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Serves until a fatal fault.
    ///
    /// Never returns `Ok`: a worker either serves or dies. The returned
    /// error is [`CohortError::Fatal`] when a broker subscription or the
    /// polling sweeper ended (a handler panic included), or
    /// [`CohortError::Serve`] when the listener failed.
    pub async fn run(self) -> Result<(), CohortError> {
        let Worker {
            worker_id,
            local_addr,
            listener,
            router,
            mut subscriptions,
            mut sweeper,
            ..
        } = self;
        tracing::info!(%worker_id, addr = %local_addr, "worker serving");

        let channels: Vec<String> = subscriptions
            .iter()
            .map(|s| s.channel().to_string())
            .collect();
        let server = axum::serve(listener, router).into_future();
        let subscription_ended = futures_util::future::select_all(
            subscriptions.iter_mut().map(|s| Box::pin(s.closed())),
        );

        let reason = tokio::select! {
            result = server => {
                result.map_err(CohortError::Serve)?;
                "server stopped accepting".to_string()
            }
            (end, index, _) = subscription_ended => {
                let channel = &channels[index];
                match end {
                    SubscriptionEnd::Panicked(message) => {
                        format!("handler for `{channel}` panicked: {message}")
                    }
                    other => format!("subscription to `{channel}` ended: {other:?}"),
                }
            }
            joined = &mut sweeper.0 => match joined {
                Err(e) if e.is_panic() => "polling sweeper panicked".to_string(),
                _ => "polling sweeper stopped".to_string(),
            },
        };

        tracing::error!(%worker_id, %reason, "fatal fault, worker exiting");
        Err(CohortError::Fatal(reason))
    }
}

impl<S, B> std::fmt::Debug for Worker<S, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("local_addr", &self.local_addr)
            .field("connections", &self.registry.len())
            .finish_non_exhaustive()
    }
}
