pub mod dispatcher;
pub mod handlers;
pub mod worker;

pub use dispatcher::{
    Ack, Dispatched, Dispatcher, Disposition, EventHandler, HandlerError, HandlerRegistry,
};
pub use handlers::learning_handlers;
pub use worker::{start_learning_consumers, ConsumerContext, ConsumerSet, CONSUMER_GROUP};
