pub mod decision;
pub mod dispatcher;

pub use decision::DecisionEngine;
pub use dispatcher::Dispatcher;
