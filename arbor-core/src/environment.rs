//! Signal Environment
//!
//! Process-wide configuration for the signal runtime: the wire codec, the
//! dispatchers used for effects and result notifications, and the sink for
//! errors that have no caller to return to.
//!
//! # Defaults
//!
//! Everything has a built-in default, so [`SignalEnvironment::initialize`]
//! is optional:
//!
//! - codec: [`Codec::Json`]
//! - effects and result notifications: [`SynchronousDispatcher`]
//! - asynchronous work: a tokio runtime owned by the crate, started lazily
//!
//! # Overrides
//!
//! Code that needs a different dispatcher for a while (a UI session, a test)
//! registers a selector with [`SignalEnvironment::add_dispatcher_override`].
//! Selectors are asked newest first and may return `None` to defer to older
//! selectors and finally to the configured dispatcher.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::codec::Codec;
use crate::error::{Result, SignalError};
use crate::reactive::dispatcher::{Dispatcher, SynchronousDispatcher, TokioDispatcher};

/// Picks a dispatcher for the current context, or defers with `None`.
pub type DispatcherSelector = Arc<dyn Fn() -> Option<Arc<dyn Dispatcher>> + Send + Sync>;

/// Settings applied by [`SignalEnvironment::initialize`].
#[derive(Clone, Default)]
pub struct EnvironmentConfig {
    pub codec: Option<Codec>,
    pub default_dispatcher: Option<Arc<dyn Dispatcher>>,
    pub asynchronous_dispatcher: Option<Arc<dyn Dispatcher>>,
    pub result_notifier: Option<Arc<dyn Dispatcher>>,
}

impl EnvironmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_default_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.default_dispatcher = Some(dispatcher);
        self
    }

    pub fn with_asynchronous_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.asynchronous_dispatcher = Some(dispatcher);
        self
    }

    pub fn with_result_notifier(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.result_notifier = Some(dispatcher);
        self
    }
}

impl std::fmt::Debug for EnvironmentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentConfig")
            .field("codec", &self.codec)
            .field("default_dispatcher", &self.default_dispatcher.is_some())
            .field("asynchronous_dispatcher", &self.asynchronous_dispatcher.is_some())
            .field("result_notifier", &self.result_notifier.is_some())
            .finish()
    }
}

type Overrides = RwLock<Vec<(u64, DispatcherSelector)>>;

static CONFIG: OnceLock<EnvironmentConfig> = OnceLock::new();
static DISPATCHER_OVERRIDES: OnceLock<Overrides> = OnceLock::new();
static NOTIFIER_OVERRIDES: OnceLock<Overrides> = OnceLock::new();
static FALLBACK_ASYNC: OnceLock<Arc<dyn Dispatcher>> = OnceLock::new();
static NEXT_OVERRIDE: AtomicU64 = AtomicU64::new(0);

fn dispatcher_overrides() -> &'static Overrides {
    DISPATCHER_OVERRIDES.get_or_init(|| RwLock::new(Vec::new()))
}

fn notifier_overrides() -> &'static Overrides {
    NOTIFIER_OVERRIDES.get_or_init(|| RwLock::new(Vec::new()))
}

thread_local! {
    static ERROR_HANDLERS: RefCell<Vec<Rc<dyn Fn(&SignalError)>>> = const { RefCell::new(Vec::new()) };
}

/// Process-wide signal configuration.
pub struct SignalEnvironment;

impl SignalEnvironment {
    /// Apply the configuration. Fails if the environment was already
    /// initialized.
    pub fn initialize(config: EnvironmentConfig) -> Result<()> {
        CONFIG
            .set(config)
            .map_err(|_| SignalError::AlreadyInitialized)?;
        tracing::debug!("signal environment initialized");
        Ok(())
    }

    /// Like [`initialize`](Self::initialize), but returns `false` instead of
    /// failing when already initialized.
    pub fn try_initialize(config: EnvironmentConfig) -> bool {
        Self::initialize(config).is_ok()
    }

    pub fn is_initialized() -> bool {
        CONFIG.get().is_some()
    }

    /// The codec for command batches.
    pub fn codec() -> Codec {
        CONFIG
            .get()
            .and_then(|config| config.codec)
            .unwrap_or_default()
    }

    /// The dispatcher that runs effects.
    pub fn default_dispatcher() -> Arc<dyn Dispatcher> {
        select(dispatcher_overrides()).unwrap_or_else(|| {
            CONFIG
                .get()
                .and_then(|config| config.default_dispatcher.clone())
                .unwrap_or_else(|| Arc::new(SynchronousDispatcher))
        })
    }

    /// Runs tasks immediately on the calling thread.
    pub fn synchronous_dispatcher() -> Arc<dyn Dispatcher> {
        Arc::new(SynchronousDispatcher)
    }

    /// The dispatcher for work that must not run on the caller's thread.
    pub fn asynchronous_dispatcher() -> Arc<dyn Dispatcher> {
        CONFIG
            .get()
            .and_then(|config| config.asynchronous_dispatcher.clone())
            .unwrap_or_else(|| {
                FALLBACK_ASYNC
                    .get_or_init(|| match TokioDispatcher::background() {
                        Some(dispatcher) => Arc::new(dispatcher),
                        None => Arc::new(SynchronousDispatcher),
                    })
                    .clone()
            })
    }

    /// The dispatcher that delivers operation results.
    pub fn result_notifier() -> Arc<dyn Dispatcher> {
        select(notifier_overrides()).unwrap_or_else(|| {
            CONFIG
                .get()
                .and_then(|config| config.result_notifier.clone())
                .unwrap_or_else(|| Arc::new(SynchronousDispatcher))
        })
    }

    /// Register a selector consulted before the configured effect dispatcher.
    pub fn add_dispatcher_override(
        selector: impl Fn() -> Option<Arc<dyn Dispatcher>> + Send + Sync + 'static,
    ) -> OverrideRegistration {
        OverrideRegistration::register(dispatcher_overrides(), Arc::new(selector))
    }

    /// Register a selector consulted before the configured result notifier.
    pub fn add_result_notifier_override(
        selector: impl Fn() -> Option<Arc<dyn Dispatcher>> + Send + Sync + 'static,
    ) -> OverrideRegistration {
        OverrideRegistration::register(notifier_overrides(), Arc::new(selector))
    }

    /// Report an error that cannot be returned to a caller, such as a failing
    /// effect.
    ///
    /// Goes to the innermost handler installed on this thread with
    /// [`set_error_handler`](Self::set_error_handler), otherwise it is logged.
    pub fn report_error(error: &SignalError) {
        let handler = ERROR_HANDLERS.with(|handlers| handlers.borrow().last().cloned());
        match handler {
            Some(handler) => handler(error),
            None => tracing::error!("uncaught signal error: {error}"),
        }
    }

    /// Install an error handler for the current thread until the returned
    /// guard is dropped.
    pub fn set_error_handler(handler: impl Fn(&SignalError) + 'static) -> ErrorHandlerGuard {
        ERROR_HANDLERS.with(|handlers| handlers.borrow_mut().push(Rc::new(handler)));
        ErrorHandlerGuard {
            _not_send: PhantomData,
        }
    }
}

fn select(overrides: &Overrides) -> Option<Arc<dyn Dispatcher>> {
    // Selectors run without the lock so they may register overrides themselves
    let selectors: Vec<DispatcherSelector> = overrides
        .read()
        .iter()
        .rev()
        .map(|(_, selector)| selector.clone())
        .collect();
    selectors.iter().find_map(|selector| selector())
}

/// Keeps an override selector registered. Dropping it removes the selector.
#[must_use = "the override is removed when the registration is dropped"]
pub struct OverrideRegistration {
    overrides: &'static Overrides,
    id: u64,
}

impl OverrideRegistration {
    fn register(overrides: &'static Overrides, selector: DispatcherSelector) -> Self {
        let id = NEXT_OVERRIDE.fetch_add(1, Ordering::Relaxed);
        overrides.write().push((id, selector));
        Self { overrides, id }
    }

    /// Remove the selector now.
    pub fn remove(self) {}
}

impl Drop for OverrideRegistration {
    fn drop(&mut self) {
        self.overrides
            .write()
            .retain(|(id, _)| *id != self.id);
    }
}

/// Removes the thread's innermost error handler when dropped.
#[must_use = "the error handler is removed when the guard is dropped"]
pub struct ErrorHandlerGuard {
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for ErrorHandlerGuard {
    fn drop(&mut self) {
        ERROR_HANDLERS.with(|handlers| {
            handlers.borrow_mut().pop();
        });
    }
}
