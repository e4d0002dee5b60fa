//! Overriding the time a request started.
//!
//! A proxy in front of the gateway may know better than the gateway when a
//! request really began, e.g. from a queueing header. Putting that time in
//! the request context makes both the span and the duration metric use it.

use std::time::SystemTime;

use opentelemetry::Context;

#[derive(Clone, Copy)]
struct StartTime(SystemTime);

/// Returns a copy of `parent` carrying `start`.
///
/// Call this at most once per request: a second call replaces the first
/// value and the measured duration will be off.
pub fn context_with_start_time(parent: &Context, start: SystemTime) -> Context {
    parent.with_value(StartTime(start))
}

/// The start time carried by `cx`, if one was set.
pub fn start_time_from_context(cx: &Context) -> Option<SystemTime> {
    cx.get::<StartTime>().map(|StartTime(start)| *start)
}
