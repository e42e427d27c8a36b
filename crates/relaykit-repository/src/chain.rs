//! Interceptor chain: a priority-ordered middleware pipeline around every
//! persistence operation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use relaykit_core::error::DomainError;

use crate::operation::{OperationContext, OperationOutcome};

/// Boxed future returned by [`Next::run`].
pub type OutcomeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<OperationOutcome, DomainError>> + Send + 'a>>;

/// The store call at the end of a chain.
#[async_trait]
pub trait Terminal: Send {
    /// Executes the operation against the underlying store.
    async fn execute(&mut self, ctx: &OperationContext) -> Result<OperationOutcome, DomainError>;
}

/// A handler wrapped around persistence operations.
///
/// Implementors usually override the hooks and keep the default
/// `intercept`. Overriding `intercept` allows short-circuiting by not
/// calling `next`.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Lower values run first (outermost).
    fn priority(&self) -> i32 {
        100
    }

    /// Runs before a single-record operation or a read.
    ///
    /// # Errors
    ///
    /// An error aborts the operation.
    fn before_operation(&self, _ctx: &mut OperationContext) -> Result<(), DomainError> {
        Ok(())
    }

    /// Runs after a single-record operation or a read succeeded.
    ///
    /// # Errors
    ///
    /// An error replaces the outcome.
    fn after_operation(
        &self,
        _ctx: &OperationContext,
        _outcome: &mut OperationOutcome,
    ) -> Result<(), DomainError> {
        Ok(())
    }

    /// Runs before a batch operation.
    ///
    /// # Errors
    ///
    /// An error aborts the operation.
    fn before_batch(&self, _ctx: &mut OperationContext) -> Result<(), DomainError> {
        Ok(())
    }

    /// Runs after a batch operation succeeded.
    ///
    /// # Errors
    ///
    /// An error replaces the outcome.
    fn after_batch(
        &self,
        _ctx: &OperationContext,
        _outcome: &mut OperationOutcome,
    ) -> Result<(), DomainError> {
        Ok(())
    }

    /// Wraps the rest of the chain.
    async fn intercept(
        &self,
        ctx: &mut OperationContext,
        next: Next<'_>,
    ) -> Result<OperationOutcome, DomainError> {
        let batch = ctx.operation.is_batch();
        if batch {
            self.before_batch(ctx)?;
        } else {
            self.before_operation(ctx)?;
        }
        let mut outcome = next.run(ctx).await?;
        if batch {
            self.after_batch(ctx, &mut outcome)?;
        } else {
            self.after_operation(ctx, &mut outcome)?;
        }
        Ok(outcome)
    }
}

/// Continuation handed to an interceptor: the interceptors after it plus
/// the terminal.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Interceptor>],
    terminal: &'a mut (dyn Terminal + 'a),
}

impl<'a> Next<'a> {
    /// Runs the rest of the chain.
    pub fn run<'b>(self, ctx: &'b mut OperationContext) -> OutcomeFuture<'b>
    where
        'a: 'b,
    {
        match self.remaining.split_first() {
            Some((head, rest)) => head.intercept(
                ctx,
                Next {
                    remaining: rest,
                    terminal: self.terminal,
                },
            ),
            None => self.terminal.execute(ctx),
        }
    }
}

/// An ordered list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl InterceptorChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an interceptor, keeping the chain sorted by priority. Equal
    /// priorities keep insertion order.
    #[must_use]
    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.push(Arc::new(interceptor));
        self
    }

    /// Adds a shared interceptor, keeping the chain sorted by priority.
    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
        self.interceptors.sort_by_key(|i| i.priority());
    }

    /// Interceptor names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Number of interceptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether the chain has no interceptors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Runs `ctx` through every interceptor and finally `terminal`.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by an interceptor or the terminal.
    pub async fn execute(
        &self,
        ctx: &mut OperationContext,
        terminal: &mut (dyn Terminal + '_),
    ) -> Result<OperationOutcome, DomainError> {
        Next {
            remaining: &self.interceptors,
            terminal,
        }
        .run(ctx)
        .await
    }
}
