use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use netops::dns::{
    DnsOverHttpsConnFunc, DnsOverTcpConnFunc, DnsOverTlsConnFunc, DnsOverUdpConnFunc, DnsQuery,
    RecordType, UnusedDialer,
};
use netops::errclass::ErrClass;
use netops::tls::TlsConn as _;
use netops::{
    compose5, compose6, compose7, endpoint_func, CancelWatchFunc, Config, ConnectFunc, Context,
    Dialer as _, Func as _, HttpConnFunc, Logger, Network, ObserveFunc, SpanId, TlsConfig,
    TlsHandshakeFunc,
};

mod support;

fn sorted(mut addrs: Vec<Ipv4Addr>) -> Vec<Ipv4Addr> {
    addrs.sort();
    addrs
}

fn expected() -> Vec<Ipv4Addr> {
    sorted(support::DNS_ANSWERS.to_vec())
}

async fn exchange_over_udp(endpoint: SocketAddr) -> Vec<Ipv4Addr> {
    let config = Config::new().with_err_classifier(ErrClass);
    let logger = Logger::current().with_span_id(&SpanId::new());
    let pipeline = compose5(
        endpoint_func(endpoint),
        ConnectFunc::new(&config, Network::Udp, logger.clone()),
        ObserveFunc::new(&config, logger.clone()),
        CancelWatchFunc::new(&config),
        DnsOverUdpConnFunc::new(&config, logger),
    );

    let (ctx, _cancel) = Context::background().with_timeout(Duration::from_secs(5));
    let conn = pipeline.call(&ctx, ()).await.unwrap();
    let response = conn
        .exchange(&ctx, &DnsQuery::new("dns.google", RecordType::A))
        .await
        .unwrap();
    conn.close().unwrap();
    sorted(response.records_a().unwrap())
}

#[tokio::test]
async fn udp_pipeline() {
    let (events, _guard) = support::capture_events();
    let endpoint = support::udp_dns_server().await;

    assert_eq!(exchange_over_udp(endpoint).await, expected());
    assert!(events.in_order(&[
        "connectStart",
        "connectDone",
        "dnsExchangeStart",
        "dnsQuery",
        "writeStart",
        "writeDone",
        "readStart",
        "readDone",
        "dnsResponse",
        "dnsExchangeDone",
        "closeStart",
        "closeDone",
    ]));
    assert_eq!(events.field("dnsExchangeDone", "err"), Some(String::new()));
    assert_eq!(
        events.field("dnsExchangeDone", "remoteAddr"),
        Some(endpoint.to_string())
    );
}

#[tokio::test]
#[ignore = "needs access to 8.8.8.8"]
async fn udp_pipeline_against_google() {
    let addrs = exchange_over_udp(SocketAddr::from(([8, 8, 8, 8], 53))).await;
    assert_eq!(
        addrs,
        [Ipv4Addr::new(8, 8, 4, 4), Ipv4Addr::new(8, 8, 8, 8)]
    );
}

#[tokio::test]
async fn tcp_pipeline_reuses_the_stream() {
    let (events, _guard) = support::capture_events();
    let endpoint = support::stream_dns_server(None).await;
    let config = Config::new();
    let logger = Logger::current();
    let pipeline = compose5(
        endpoint_func(endpoint),
        ConnectFunc::new(&config, Network::Tcp, logger.clone()),
        ObserveFunc::new(&config, logger.clone()),
        CancelWatchFunc::new(&config),
        DnsOverTcpConnFunc::new(&config, logger),
    );

    let ctx = Context::background();
    let conn = pipeline.call(&ctx, ()).await.unwrap();
    for _ in 0..3 {
        let response = conn
            .exchange(&ctx, &DnsQuery::new("dns.google", RecordType::A))
            .await
            .unwrap();
        assert_eq!(sorted(response.records_a().unwrap()), expected());
    }
    conn.close().unwrap();

    assert_eq!(events.count("connectDone"), 1);
    assert_eq!(events.count("dnsExchangeDone"), 3);
    assert_eq!(
        events.field("dnsExchangeStart", "serverProtocol"),
        Some("tcp".to_owned())
    );
}

#[tokio::test]
async fn dot_pipeline() {
    let (events, _guard) = support::capture_events();
    let pki = support::Pki::new(&["dns.test"]);
    let endpoint = support::stream_dns_server(Some(pki.server_config(&["dot"]))).await;

    let config = Config::new();
    let logger = Logger::current();
    let tls = TlsConfig::new("dns.test")
        .with_root_certs(pki.roots.clone())
        .with_next_protos(["dot"]);
    let pipeline = compose6(
        endpoint_func(endpoint),
        ConnectFunc::new(&config, Network::Tcp, logger.clone()),
        ObserveFunc::new(&config, logger.clone()),
        CancelWatchFunc::new(&config),
        TlsHandshakeFunc::new(&config, tls, logger.clone()),
        DnsOverTlsConnFunc::new(&config, logger),
    );

    let ctx = Context::background();
    let conn = pipeline.call(&ctx, ()).await.unwrap();
    let response = conn
        .exchange(&ctx, &DnsQuery::new("dns.google", RecordType::A))
        .await
        .unwrap();
    assert_eq!(sorted(response.records_a().unwrap()), expected());
    assert_eq!(
        conn.conn().connection_state().negotiated_protocol.as_deref(),
        Some("dot")
    );
    conn.close().unwrap();

    assert!(events.in_order(&[
        "tlsHandshakeStart",
        "tlsHandshakeDone",
        "dnsExchangeStart",
        "dnsQuery",
        "dnsResponse",
        "dnsExchangeDone",
    ]));
    assert_eq!(
        events.field("dnsExchangeDone", "serverProtocol"),
        Some("dot".to_owned())
    );
}

#[tokio::test]
async fn doh_pipeline_over_h2() {
    let (events, _guard) = support::capture_events();
    let pki = support::Pki::new(&["dns.test"]);
    let endpoint = support::http_server(Some(pki.server_config(&["h2", "http/1.1"]))).await;

    let config = Config::new();
    let logger = Logger::current();
    let tls = TlsConfig::new("dns.test")
        .with_root_certs(pki.roots.clone())
        .with_next_protos(["h2", "http/1.1"]);
    let pipeline = compose7(
        endpoint_func(endpoint),
        ConnectFunc::new(&config, Network::Tcp, logger.clone()),
        ObserveFunc::new(&config, logger.clone()),
        CancelWatchFunc::new(&config),
        TlsHandshakeFunc::new(&config, tls, logger.clone()),
        HttpConnFunc::tls(&config, logger.clone()),
        DnsOverHttpsConnFunc::new(
            &config,
            format!("https://dns.test:{}/dns-query", endpoint.port()),
            logger,
        ),
    );

    let ctx = Context::background();
    let conn = pipeline.call(&ctx, ()).await.unwrap();
    for _ in 0..2 {
        let response = conn
            .exchange(&ctx, &DnsQuery::new("dns.google", RecordType::A))
            .await
            .unwrap();
        assert_eq!(sorted(response.records_a().unwrap()), expected());
        assert_eq!(response.query().id(), 0);
    }
    assert_eq!(conn.http_conn().version(), http::Version::HTTP_2);
    conn.close().unwrap();

    assert!(events.in_order(&[
        "dnsExchangeStart",
        "dnsQuery",
        "httpRoundTripStart",
        "httpRoundTripDone",
        "dnsResponse",
        "dnsExchangeDone",
    ]));
    assert_eq!(events.count("dnsExchangeDone"), 2);
    assert_eq!(
        events.field("httpRoundTripDone", "httpResponseStatusCode"),
        Some("200".to_owned())
    );
}

#[tokio::test]
async fn doh_over_http1_carries_one_exchange() {
    let endpoint = support::http_server(None).await;
    let config = Config::new();
    let logger = Logger::current();
    let pipeline = compose5(
        endpoint_func(endpoint),
        ConnectFunc::new(&config, Network::Tcp, logger.clone()),
        ObserveFunc::new(&config, logger.clone()),
        HttpConnFunc::plain(&config, logger.clone()),
        DnsOverHttpsConnFunc::new(&config, format!("http://{endpoint}/dns-query"), logger),
    );

    let ctx = Context::background();
    let conn = pipeline.call(&ctx, ()).await.unwrap();
    let query = DnsQuery::new("dns.google", RecordType::A);

    let response = conn.exchange(&ctx, &query).await.unwrap();
    assert_eq!(sorted(response.records_a().unwrap()), expected());

    let err = conn.exchange(&ctx, &query).await.unwrap_err();
    assert!(matches!(err, netops::Error::SingleUseDial));
    conn.close().unwrap();
}

#[test]
#[should_panic(expected = "must not dial")]
fn unused_dialer_always_panics() {
    let ctx = Context::background();
    let _ = UnusedDialer.dial(&ctx, Network::Tcp, "127.0.0.1:53");
}
