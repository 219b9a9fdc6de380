//! Bridges emitter events to `tracing`.
//!
//! ```ignore
//! let scheduler = Scheduler::http(config)?;
//! bind_logger(scheduler.events(), "[fleet] ");
//! ```

use tracing::{debug, error, info, warn};

use crate::events::{names, EventEmitter, ListenerId, RestEvent};
use crate::request::Request;

const LOGGED_EVENTS: [&str; 9] = [
    names::REQUEST_START,
    names::REQUEST_DATA,
    names::REQUEST_COMPLETE,
    names::REQUEST_ERROR_IGNORED,
    names::ERROR,
    names::WARNING,
    names::START_SENDING_REQUESTS,
    names::STOP_SENDING_REQUESTS,
    names::COMPLETE_ALL_ACTIVE_REQUESTS,
];

/// Log every event reaching `events`, each line prefixed by `header`.
///
/// Remove the logger with `events.off_all(id)`.
pub fn bind_logger(events: &EventEmitter<RestEvent>, header: impl Into<String>) -> ListenerId {
    let header = header.into();
    events.on_each(&LOGGED_EVENTS, move |event: &RestEvent| match event {
        RestEvent::Start { id } => info!(request_id = %id, "{header}request started"),
        RestEvent::Data { id, .. } => debug!(request_id = %id, "{header}request data"),
        RestEvent::Complete { id } => info!(request_id = %id, "{header}request complete"),
        RestEvent::ErrorIgnored { id, error } => {
            info!(request_id = %id, error = %error, "{header}request error ignored")
        }
        RestEvent::Error { id, error } => {
            error!(request_id = ?id.map(|i| i.as_u64()), error = %error, "{header}{error}")
        }
        RestEvent::Warning { id, message } => {
            warn!(request_id = ?id.map(|i| i.as_u64()), "{header}{message}")
        }
        RestEvent::DispatchStarted => info!("{header}started sending requests"),
        RestEvent::DispatchStopped => info!("{header}stopped sending requests"),
        RestEvent::ActiveDrained => debug!("{header}all active requests complete"),
    })
}

/// Log the events of `request`, prefixed by its `log_header` hook.
pub fn bind_request_logger(request: &Request) -> ListenerId {
    bind_logger(request.events(), request.hooks().log_header(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RestError;

    #[test]
    fn test_bind_and_unbind() {
        let request = Request::get("http://svc/a");
        let id = bind_request_logger(&request);
        assert_eq!(request.events().listener_count(names::ERROR), 1);

        request
            .events()
            .emit_error(Some(request.id()), RestError::transport("down"))
            .unwrap();
        request.events().emit_warning(None, "slow").unwrap();

        request.events().off_all(id);
        for name in LOGGED_EVENTS {
            assert_eq!(request.events().listener_count(name), 0);
        }
    }
}
