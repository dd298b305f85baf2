//! MQTT-over-TLS transport for printers in LAN mode.

use async_trait::async_trait;
use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rumqttc::tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, SignatureScheme};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, SubAck,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{
    ConnectParams, DeviceConnection, DeviceTransport, LinkError, SessionEvent, SessionEvents,
};

const REQUEST_CAPACITY: usize = 100;

/// Incoming packet limit. Full status reports of printers with an AMS run
/// well past rumqttc's 10 KiB default.
pub const MAX_REPORT_SIZE: usize = 4 * 1024 * 1024;
/// Outgoing requests are small pushall/control payloads.
const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Printers present a self-signed certificate that chains to nothing, so the
/// handshake accepts any server certificate.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn device_tls() -> TlsConfiguration {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    TlsConfiguration::Rustls(Arc::new(config))
}

fn mqtt_options(params: &ConnectParams) -> MqttOptions {
    let mut options = MqttOptions::new(params.session.as_str(), &params.host, params.port);
    options
        .set_credentials(params.username.clone(), params.password.clone())
        .set_keep_alive(params.keep_alive.max(Duration::from_secs(1)))
        .set_clean_session(true)
        .set_max_packet_size(MAX_REPORT_SIZE, MAX_REQUEST_SIZE)
        .set_transport(Transport::tls_with_config(device_tls()));
    options
}

/// Opens one rumqttc client per session.
#[derive(Debug, Clone, Default)]
pub struct RumqttTransport;

impl RumqttTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceTransport for RumqttTransport {
    async fn open(
        &self,
        params: ConnectParams,
        events: SessionEvents,
    ) -> Result<Box<dyn DeviceConnection>, LinkError> {
        if params.host.trim().is_empty() {
            return Err(LinkError::ConnectFailed("printer host is empty".into()));
        }

        let options = mqtt_options(&params);
        debug!("Opening MQTT session: {:?}", params);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let pump = tokio::spawn(pump(event_loop, params.connect_timeout, events));

        Ok(Box::new(RumqttConnection { client, pump }))
    }
}

struct RumqttConnection {
    client: AsyncClient,
    pump: JoinHandle<()>,
}

#[async_trait]
impl DeviceConnection for RumqttConnection {
    async fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| LinkError::Subscribe(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| LinkError::Publish(e.to_string()))
    }

    fn abort(&self) {
        self.pump.abort();
    }
}

impl Drop for RumqttConnection {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(ack)) = event_loop.poll().await? {
            debug!("ConnAck: {:?}", ack.code);
            return Ok(());
        }
    }
}

fn suback_event(ack: &SubAck) -> SessionEvent {
    if ack.return_codes.contains(&SubscribeReasonCode::Failure) {
        SessionEvent::Closed {
            reason: LinkError::Subscribe("rejected by broker".into()).to_string(),
        }
    } else {
        SessionEvent::Subscribed
    }
}

/// Drives the event loop and forwards what matters to the link.
///
/// Polling stops at the first error. rumqttc would reconnect on the next
/// poll; the link decides about new sessions instead.
async fn pump(mut event_loop: EventLoop, connect_timeout: Duration, events: SessionEvents) {
    let session = events.session().clone();

    let connected = tokio::time::timeout(connect_timeout, wait_for_connack(&mut event_loop)).await;
    let first = match connected {
        Ok(Ok(())) => SessionEvent::Connected,
        Ok(Err(e)) => SessionEvent::Closed {
            reason: e.to_string(),
        },
        Err(_) => SessionEvent::Closed {
            reason: LinkError::ConnectTimeout(connect_timeout).to_string(),
        },
    };
    let is_closed = matches!(first, SessionEvent::Closed { .. });
    if !events.emit(first).await || is_closed {
        return;
    }
    info!("MQTT session {} connected", session);

    loop {
        let event = match event_loop.poll().await {
            Ok(Event::Incoming(Packet::SubAck(ack))) => suback_event(&ack),
            Ok(Event::Incoming(Packet::Publish(publish))) => SessionEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Ok(_) => continue,
            Err(e) => {
                warn!("MQTT session {} lost: {}", session, e);
                SessionEvent::Closed {
                    reason: e.to_string(),
                }
            }
        };

        let is_closed = matches!(event, SessionEvent::Closed { .. });
        if !events.emit(event).await || is_closed {
            debug!("MQTT pump for {} finished", session);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::link::LinkInput;
    use crate::mqtt::SessionId;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;
    use rumqttc::mqttbytes::v4::{self, Publish};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn params(host: &str, port: u16) -> ConnectParams {
        ConnectParams {
            session: SessionId::generate(),
            host: host.to_string(),
            port,
            username: "bblp".to_string(),
            password: "secret".to_string(),
            connect_timeout: Duration::from_secs(1),
            keep_alive: Duration::from_secs(30),
        }
    }

    #[test]
    fn large_reports_fit_the_packet_limit() {
        let options = mqtt_options(&params("10.0.0.5", 8883));
        assert_eq!(options.max_packet_size(), MAX_REPORT_SIZE);

        let report = format!(
            r#"{{"print":{{"gcode_state":"RUNNING","ams":"{}"}}}}"#,
            "x".repeat(64 * 1024)
        );
        let mut buf = BytesMut::new();
        Publish::new("device/ABC123/report", QoS::AtMostOnce, report.clone())
            .write(&mut buf)
            .unwrap();

        match v4::read(&mut buf, options.max_packet_size()).unwrap() {
            v4::Packet::Publish(publish) => assert_eq!(publish.payload.len(), report.len()),
            other => panic!("expected a publish, got {:?}", other),
        }
    }

    #[test]
    fn rejected_subscription_closes_the_session() {
        let rejected = suback_event(&SubAck::new(1, vec![SubscribeReasonCode::Failure]));
        assert!(matches!(
            rejected,
            SessionEvent::Closed { reason } if reason.contains("rejected by broker")
        ));

        let granted = suback_event(&SubAck::new(
            1,
            vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
        ));
        assert_eq!(granted, SessionEvent::Subscribed);
    }

    #[tokio::test]
    async fn empty_host_is_refused_without_a_session() {
        let (tx, _rx) = mpsc::channel(4);
        let params = params("  ", 8883);
        let events = SessionEvents::new(params.session.clone(), tx);

        let result = RumqttTransport::new().open(params, events).await;
        assert!(matches!(result, Err(LinkError::ConnectFailed(_))));
    }

    #[tokio::test]
    async fn silent_broker_times_out_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accepts and then never says a word.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let (tx, mut rx) = mpsc::channel(4);
        let params = params("127.0.0.1", port);
        let session = params.session.clone();
        let events = SessionEvents::new(session.clone(), tx);
        let _connection = RumqttTransport::new().open(params, events).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        match first {
            Some(LinkInput::Session {
                session: from,
                event: SessionEvent::Closed { reason },
            }) => {
                assert_eq!(from, session);
                assert!(reason.contains("timed out"), "reason: {}", reason);
            }
            _ => panic!("expected a closed session event"),
        }

        // The pump is done and nothing retries.
        let next = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
