//! Scripted HTTP client
//!
//! Ordered one-shot expectations plus reusable prefix stubs. Any request
//! matching neither is a test bug and panics with the offending URL.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use weave_core::provider::{HttpCallback, HttpClient, HttpMethod, HttpRequest, HttpResponse};
use weave_core::Error;

use crate::runner::FakeTaskRunner;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub body: Option<String>,
}

enum Reply {
    Response { status: u16, body: String },
    TransportError(String),
}

struct Expectation {
    method: HttpMethod,
    url: String,
    reply: Reply,
}

struct Stub {
    method: HttpMethod,
    url_prefix: String,
    status: u16,
    body: String,
}

struct Inner {
    expectations: VecDeque<Expectation>,
    stubs: Vec<Stub>,
    requests: Vec<RecordedRequest>,
}

/// HTTP double that answers from a script. Completion callbacks are posted
/// on the fake runner, matching the asynchronous provider contract.
#[derive(Clone)]
pub struct FakeHttpClient {
    runner: FakeTaskRunner,
    inner: Rc<RefCell<Inner>>,
}

impl FakeHttpClient {
    pub fn new(runner: FakeTaskRunner) -> Self {
        Self {
            runner,
            inner: Rc::new(RefCell::new(Inner {
                expectations: VecDeque::new(),
                stubs: Vec::new(),
                requests: Vec::new(),
            })),
        }
    }

    /// Queue an exact-URL expectation answered once, in order.
    pub fn expect(&self, method: HttpMethod, url: impl Into<String>, status: u16, body: impl Into<String>) {
        self.inner.borrow_mut().expectations.push_back(Expectation {
            method,
            url: url.into(),
            reply: Reply::Response {
                status,
                body: body.into(),
            },
        });
    }

    /// Queue an expectation that fails at the transport layer.
    pub fn expect_transport_error(&self, method: HttpMethod, url: impl Into<String>, message: impl Into<String>) {
        self.inner.borrow_mut().expectations.push_back(Expectation {
            method,
            url: url.into(),
            reply: Reply::TransportError(message.into()),
        });
    }

    /// Register a reusable fallback matched by URL prefix.
    pub fn stub(&self, method: HttpMethod, url_prefix: impl Into<String>, status: u16, body: impl Into<String>) {
        self.inner.borrow_mut().stubs.push(Stub {
            method,
            url_prefix: url_prefix.into(),
            status,
            body: body.into(),
        });
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.borrow().requests.clone()
    }

    /// Unanswered one-shot expectations.
    pub fn remaining_expectations(&self) -> usize {
        self.inner.borrow().expectations.len()
    }
}

impl HttpClient for FakeHttpClient {
    fn send_request(&self, request: HttpRequest, callback: HttpCallback) {
        let reply = {
            let mut inner = self.inner.borrow_mut();
            inner.requests.push(RecordedRequest {
                method: request.method.as_str().to_string(),
                url: request.url.clone(),
                body: request
                    .body
                    .as_ref()
                    .map(|body| String::from_utf8_lossy(body).into_owned()),
            });

            let front_matches = inner
                .expectations
                .front()
                .is_some_and(|exp| exp.method == request.method && exp.url == request.url);
            if front_matches {
                let exp = inner.expectations.pop_front().expect("checked above");
                match exp.reply {
                    Reply::Response { status, body } => Ok(HttpResponse {
                        status,
                        content_type: "application/json; charset=utf-8".to_string(),
                        body: body.into_bytes(),
                    }),
                    Reply::TransportError(message) => Err(Error::transport(message)),
                }
            } else if let Some(stub) = inner.stubs.iter().find(|stub| {
                stub.method == request.method && request.url.starts_with(&stub.url_prefix)
            }) {
                Ok(HttpResponse {
                    status: stub.status,
                    content_type: "application/json; charset=utf-8".to_string(),
                    body: stub.body.clone().into_bytes(),
                })
            } else {
                panic!(
                    "unexpected HTTP request: {} {}",
                    request.method.as_str(),
                    request.url
                );
            }
        };
        use weave_core::provider::TaskRunner;
        self.runner.post(Box::new(move || callback(reply)));
    }
}
