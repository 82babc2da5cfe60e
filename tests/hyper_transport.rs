use std::collections::BTreeMap;
use std::time::Duration;

use loadforge_vu::models::dsl_model::{Auth, Body, HttpMethod};
use loadforge_vu::{HttpRequest, HyperTransport, Transport, VuId};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn login_form() -> Body {
    let mut form = BTreeMap::new();
    form.insert("username".to_string(), json!("user0"));
    form.insert("password".to_string(), json!("password!"));
    Body::Form(form)
}

#[tokio::test]
async fn test_login_redirect_is_not_followed_and_cookie_is_kept() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_string_contains("username=user0"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "/")
                .insert_header("Set-Cookie", "JSESSIONID=abc123; Path=/; HttpOnly"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cart"))
        .and(header("cookie", "JSESSIONID=abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_string("cart"))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HyperTransport::new(None);
    let vu = VuId(1);

    let mut login = HttpRequest::new("login", HttpMethod::POST, format!("{}/login", server.uri()));
    login.body = Some(login_form());
    login.follow_redirects = false;
    let record = transport.send(vu, login).await;
    assert_eq!(record.status(), 302);
    assert_eq!(record.header("location"), Some("/"));
    assert_eq!(transport.cookies(vu), vec![("JSESSIONID".to_string(), "abc123".to_string())]);

    let cart = transport
        .send(vu, HttpRequest::new("cart", HttpMethod::GET, format!("{}/cart", server.uri())))
        .await;
    assert_eq!(cart.status(), 200);
    assert_eq!(cart.text(), "cart");

    // jars are per virtual user
    assert!(transport.cookies(VuId(2)).is_empty());
    transport.release(vu);
    assert!(transport.cookies(vu).is_empty());
}

#[tokio::test]
async fn test_iteration_reset_empties_only_that_jar() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(302).insert_header("Set-Cookie", "JSESSIONID=s1; Path=/"))
        .mount(&server)
        .await;

    let transport = HyperTransport::new(None);
    for vu in [VuId(1), VuId(2)] {
        let mut login = HttpRequest::new("login", HttpMethod::POST, format!("{}/login", server.uri()));
        login.follow_redirects = false;
        transport.send(vu, login).await;
    }
    assert_eq!(transport.cookies(VuId(1)).len(), 1);

    transport.reset_iteration(VuId(1));
    assert!(transport.cookies(VuId(1)).is_empty());
    assert_eq!(transport.cookies(VuId(2)).len(), 1);
}

#[tokio::test]
async fn test_redirects_followed_by_default() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "orderId": 7 })))
        .mount(&server)
        .await;

    let transport = HyperTransport::new(None);
    let record = transport
        .send(VuId(1), HttpRequest::new("old", HttpMethod::GET, format!("{}/old", server.uri())))
        .await;

    assert_eq!(record.status(), 200);
    assert_eq!(record.json_pointer("/orderId"), Some(&json!(7)));
}

#[tokio::test]
async fn test_json_body_query_and_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pay/confirm"))
        .and(query_param("source", "load"))
        .and(header("authorization", "Bearer t0ken"))
        .and(header("content-type", "application/json"))
        .and(body_string_contains("\"orderId\":\"ORD-1\""))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HyperTransport::new(None);
    let mut request = HttpRequest::new("pay_confirm", HttpMethod::POST, format!("{}/pay/confirm", server.uri()));
    request.query.push(("source".to_string(), "load".to_string()));
    request.auth = Some(Auth::Bearer { token: "t0ken".to_string() });
    request.body = Some(Body::Json(json!({ "orderId": "ORD-1", "amount": 12000 })));

    let record = transport.send(VuId(3), request).await;
    assert_eq!(record.status(), 200);
    assert!(!record.is_failed());
}

#[tokio::test]
async fn test_timeout_becomes_failed_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let transport = HyperTransport::new(None);
    let mut request = HttpRequest::new("slow", HttpMethod::GET, format!("{}/slow", server.uri()));
    request.timeout = Some(Duration::from_millis(50));

    let record = transport.send(VuId(1), request).await;
    assert_eq!(record.status(), 0);
    assert_eq!(record.error(), Some("Timeout"));
    assert!(record.is_transport_error());
    assert!(record.is_failed());
}

#[tokio::test]
async fn test_server_error_is_failed_but_not_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let transport = HyperTransport::new(None);
    let record = transport
        .send(VuId(1), HttpRequest::new("any", HttpMethod::GET, format!("{}/anything", server.uri())))
        .await;
    assert_eq!(record.status(), 503);
    assert!(record.is_failed());
    assert!(!record.is_transport_error());
}
