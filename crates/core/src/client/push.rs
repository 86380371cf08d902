//! Requests the server sends to the client on the control connection.
//!
//! | Method | Answer | Event |
//! |--------|--------|-------|
//! | TEARDOWN | 200 | [`PushEvent::Teardown`] |
//! | PLAY_NOTIFY, END_OF_STREAM | 200 | [`PushEvent::EndOfStream`] |
//! | SET_PARAMETER with `X-Notice: 2101` | 200 | [`PushEvent::EndOfStream`] |
//! | SET_PARAMETER, GET_PARAMETER, OPTIONS | 200 | none |
//! | anything else | 501 | none |

use crate::protocol::headers::{NOTICE_END_OF_STREAM, SessionHeader, is_extension_header, notice_code};
use crate::protocol::{Message, Method, StatusCode};

/// Something the server told the client, applied after the exchange that
/// received it has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// The server destroyed a session (or every session when `None`).
    Teardown {
        session: Option<String>,
        location: Option<String>,
    },
    /// A stream, or the whole presentation, has no more media.
    EndOfStream {
        session: Option<String>,
        location: Option<String>,
    },
}

/// Build the response to a pushed request and the event it implies.
pub(crate) fn answer(request: &Message, version: &str, echo_x_headers: bool) -> (Message, Option<PushEvent>) {
    let session = request
        .header("Session")
        .and_then(SessionHeader::parse)
        .map(|s| s.id);
    let location = request.uri().filter(|u| *u != "*").map(str::to_string);
    let method = request.method().cloned().unwrap_or(Method::Extension(String::new()));

    let end_of_stream = || PushEvent::EndOfStream {
        session: session.clone(),
        location: location.clone(),
    };
    let (status, event) = match method {
        Method::Teardown => (
            StatusCode::OK,
            Some(PushEvent::Teardown {
                session: session.clone(),
                location: location.clone(),
            }),
        ),
        Method::PlayNotify => {
            let ended = request
                .header("Notify-Reason")
                .is_some_and(|r| r.trim().eq_ignore_ascii_case("end-of-stream"));
            (StatusCode::OK, ended.then(end_of_stream))
        }
        Method::EndOfStream => (StatusCode::OK, Some(end_of_stream())),
        Method::SetParameter => {
            let ended = request
                .header("X-Notice")
                .and_then(notice_code)
                .is_some_and(|code| code == NOTICE_END_OF_STREAM);
            (StatusCode::OK, ended.then(end_of_stream))
        }
        Method::GetParameter | Method::Options => (StatusCode::OK, None),
        _ => (StatusCode::NOT_IMPLEMENTED, None),
    };

    let mut response = Message::response(status);
    response.version = version.to_string();
    if let Some(cseq) = request.cseq() {
        response.set_cseq(cseq);
    }
    if let Some(value) = request.header("Session") {
        response.set_header("Session", value);
    }
    if echo_x_headers {
        for (name, value) in request.headers() {
            if is_extension_header(name) {
                response.set_header(name, value);
            }
        }
    }
    (response, event)
}
