//! Command side of the backbone.
//!
//! - [`Interceptor`] chain run before every dispatch, with validation,
//!   metadata, correlation and logging interceptors
//! - [`CommandBus`] routing each command type to exactly one handler
//! - [`AggregateHandler`] deciding events against a rehydrated aggregate
//! - [`CommandGateway`] serializing dispatch per aggregate on a worker pool

pub mod bus;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod interceptor;
pub mod validation;

pub use bus::{CommandBus, CommandBusBuilder, DispatchOutcome};
pub use error::{BoxError, DispatchError, ErrorKind, GatewayError, Violation};
pub use gateway::{CommandGateway, ErrorHandler, GatewayConfig};
pub use handler::{AggregateHandler, CommandHandler, Decision};
pub use interceptor::{
    CorrelationInterceptor, Interceptor, InterceptorChain, LoggingInterceptor,
    RequireMetadataInterceptor,
};
pub use validation::{Constraint, ValidationInterceptor};
