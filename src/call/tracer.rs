#[cfg(test)] use mockall::automock;

use crate::messages::Tracing;
use crate::util::random::RngRandom;


/// Creates the tracing span of each call attempt and is told how the attempt ended. This is an
///  explicit handle passed to the channel rather than global state.
#[cfg_attr(test, automock)]
pub trait Tracer: Send + Sync + 'static {
    fn new_span(&self, parent: Option<Tracing>) -> Tracing;
    fn span_finished(&self, tracing: &Tracing, service: &str, succeeded: bool);
}

/// Generates random span ids and reports nothing
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn new_span(&self, parent: Option<Tracing>) -> Tracing {
        Tracing::new_span::<RngRandom>(parent.as_ref())
    }

    fn span_finished(&self, _tracing: &Tracing, _service: &str, _succeeded: bool) {}
}
