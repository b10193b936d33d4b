//! Built-in command handlers.
//!
//! Each submodule owns one command family and exposes a `register` function;
//! [`register_all`] wires every family into a [`Dispatcher`].

pub mod file;
pub mod heartbeat;
pub mod status;
pub mod stream;
pub mod sys;

use crate::dispatch::Dispatcher;

pub fn register_all(dispatcher: &mut Dispatcher) {
    sys::register(dispatcher);
    status::register(dispatcher);
    heartbeat::register(dispatcher);
    file::register(dispatcher);
    stream::register(dispatcher);
}
