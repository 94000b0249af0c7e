//! Fuzz test for control protocol request decoding
//!
//! Every line must decode to a command or to an error response, never a
//! panic.

#![no_main]

use cowstream_core::{Command, Request, Response};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let response = match Request::parse(data) {
        Ok(request) => match Command::from_request(&request) {
            Ok(_) => return,
            Err(e) => Response::error(&e, request.id.clone()),
        },
        Err(e) => Response::error(&e, None),
    };

    assert!(!response.is_ok());
    let encoded = serde_json::to_string(&response).expect("responses always encode");
    assert!(encoded.contains("\"class\""));
});
