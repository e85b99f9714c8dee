//! Session-cookie to one-time authentication ticket exchange.

use crate::config::Endpoints;
use crate::error::LaunchError;
use crate::http::{HttpResponse, HttpTransport};
use tracing::{debug, warn};

const CSRF_HEADER: &str = "x-csrf-token";
const TICKET_HEADER: &str = "rbx-authentication-ticket";
const MAX_TICKET_ATTEMPTS: u32 = 3;

pub struct AuthTicketClient<'a> {
    transport: &'a dyn HttpTransport,
    csrf_url: String,
    ticket_url: String,
    referrer: String,
}

impl<'a> AuthTicketClient<'a> {
    pub fn new(transport: &'a dyn HttpTransport, endpoints: &Endpoints) -> Self {
        Self {
            transport,
            csrf_url: endpoints.csrf_url.clone(),
            ticket_url: endpoints.ticket_url.clone(),
            referrer: endpoints.ticket_referrer.clone(),
        }
    }

    /// The CSRF endpoint answers 403 by design; the token rides on the headers
    /// either way.
    pub fn fetch_csrf_token(&self, cookie: &str) -> Result<String, LaunchError> {
        let response = self.post(&self.csrf_url, cookie, None)?;
        token_from(&response).ok_or_else(|| LaunchError::Http {
            url: self.csrf_url.clone(),
            status: response.status,
        })
    }

    pub fn fetch_ticket(&self, cookie: &str) -> Result<String, LaunchError> {
        if cookie.trim().is_empty() {
            return Err(LaunchError::Validation(
                "session cookie must not be empty".to_string(),
            ));
        }
        let mut token = self.fetch_csrf_token(cookie)?;
        for attempt in 1..=MAX_TICKET_ATTEMPTS {
            let response = self.post(&self.ticket_url, cookie, Some(&token))?;
            if response.is_success() {
                return response
                    .header(TICKET_HEADER)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        LaunchError::Validation(format!(
                            "{} response carried no {TICKET_HEADER} header",
                            self.ticket_url
                        ))
                    });
            }
            match (response.status, token_from(&response)) {
                (403, Some(fresh)) => {
                    debug!(attempt, "csrf token rotated; retrying ticket request");
                    token = fresh;
                }
                (status, _) => {
                    warn!(status, attempt, "ticket request rejected");
                    return Err(LaunchError::Http {
                        url: self.ticket_url.clone(),
                        status,
                    });
                }
            }
        }
        warn!(attempts = MAX_TICKET_ATTEMPTS, "csrf token kept rotating");
        Err(LaunchError::Http {
            url: self.ticket_url.clone(),
            status: 403,
        })
    }

    fn post(&self, url: &str, cookie: &str, token: Option<&str>) -> Result<HttpResponse, LaunchError> {
        let mut headers = vec![
            ("Cookie".to_string(), format!(".ROBLOSECURITY={cookie}")),
            ("Referer".to_string(), self.referrer.clone()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        if let Some(token) = token {
            headers.push(("X-CSRF-TOKEN".to_string(), token.to_string()));
        }
        self.transport
            .post(url, &headers, b"{}")
            .map_err(|err| LaunchError::TransientNetwork {
                url: url.to_string(),
                attempts: 1,
                message: err.to_string(),
            })
    }
}

fn token_from(response: &HttpResponse) -> Option<String> {
    response
        .header(CSRF_HEADER)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::http::testing::StubTransport;

    fn endpoints() -> Endpoints {
        Config::default().endpoints
    }

    #[test]
    fn exchanges_cookie_for_ticket() {
        let ep = endpoints();
        let stub = StubTransport::new();
        stub.respond_with_headers(&ep.csrf_url, 403, &[("X-CSRF-TOKEN", "tok-1")], b"");
        stub.respond_with_headers(&ep.ticket_url, 200, &[("rbx-authentication-ticket", "T-123")], b"");

        let client = AuthTicketClient::new(&stub, &ep);
        assert_eq!(client.fetch_ticket("cookie").unwrap(), "T-123");

        let requests = stub.requests();
        assert_eq!(requests.len(), 2);
        let ticket_request = &requests[1];
        assert!(ticket_request
            .headers
            .iter()
            .any(|(k, v)| k == "X-CSRF-TOKEN" && v == "tok-1"));
        assert!(ticket_request
            .headers
            .iter()
            .any(|(k, v)| k == "Cookie" && v == ".ROBLOSECURITY=cookie"));
        assert!(ticket_request
            .headers
            .iter()
            .any(|(k, v)| k == "Referer" && v == &ep.ticket_referrer));
    }

    #[test]
    fn rotated_token_is_retried() {
        let ep = endpoints();
        let stub = StubTransport::new();
        stub.respond_with_headers(&ep.csrf_url, 403, &[("x-csrf-token", "old")], b"");
        stub.respond_with_headers(&ep.ticket_url, 403, &[("x-csrf-token", "new")], b"")
            .respond_with_headers(&ep.ticket_url, 200, &[("rbx-authentication-ticket", "T-9")], b"");

        let client = AuthTicketClient::new(&stub, &ep);
        assert_eq!(client.fetch_ticket("cookie").unwrap(), "T-9");
        let tokens: Vec<String> = stub
            .requests()
            .iter()
            .filter(|r| r.url == ep.ticket_url)
            .filter_map(|r| {
                r.headers
                    .iter()
                    .find(|(k, _)| k == "X-CSRF-TOKEN")
                    .map(|(_, v)| v.clone())
            })
            .collect();
        assert_eq!(tokens, vec!["old".to_string(), "new".to_string()]);
    }

    #[test]
    fn gives_up_after_three_rotations() {
        let ep = endpoints();
        let stub = StubTransport::new();
        stub.respond_with_headers(&ep.csrf_url, 403, &[("x-csrf-token", "a")], b"");
        stub.respond_with_headers(&ep.ticket_url, 403, &[("x-csrf-token", "b")], b"");

        let client = AuthTicketClient::new(&stub, &ep);
        let err = client.fetch_ticket("cookie").expect_err("rotation loop");
        assert!(matches!(err, LaunchError::Http { status: 403, .. }));
        assert_eq!(stub.count(&ep.ticket_url), 3);
    }

    #[test]
    fn missing_csrf_token_is_an_error() {
        let ep = endpoints();
        let stub = StubTransport::new();
        stub.respond(&ep.csrf_url, 401, b"");

        let client = AuthTicketClient::new(&stub, &ep);
        assert!(matches!(
            client.fetch_ticket("cookie"),
            Err(LaunchError::Http { status: 401, .. })
        ));
    }

    #[test]
    fn empty_cookie_is_rejected_without_network() {
        let ep = endpoints();
        let stub = StubTransport::new();
        let client = AuthTicketClient::new(&stub, &ep);
        assert!(matches!(
            client.fetch_ticket("  "),
            Err(LaunchError::Validation(_))
        ));
        assert!(stub.requests().is_empty());
    }
}
