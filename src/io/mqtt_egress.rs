//! MQTT client for transit reports and backend pushes
//!
//! One rumqttc connection per checkpoint (client id `RFID_DETECTOR_<id>`):
//! - DEVICE/COMMAND/DTU/<id> - transit reports (QoS 1)
//! - DEVICE/DATA/DTU/<id>, DEVICE/RESPONSE/DTU/<id> - subscribed on every ConnAck

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::OutboundReport;
use crate::io::mqtt::handle_incoming;
use crate::services::events::EventSender;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
///
/// Receives reports from the egress channel and publishes them to the
/// command topic. The event loop runs in its own task and keeps `connected`
/// current for the non-blocking hand-off.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<OutboundReport>,
    command_topic: String,
    publish_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl MqttPublisher {
    /// Create the client and spawn its event loop
    pub fn new(
        config: &Config,
        rx: mpsc::Receiver<OutboundReport>,
        connected: Arc<AtomicBool>,
        events: EventSender,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut mqttoptions =
            MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(config.mqtt_keep_alive());
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);
        let subscriptions = vec![config.mqtt_data_topic(), config.mqtt_response_topic()];

        let sub_client = client.clone();
        let loop_metrics = metrics.clone();
        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                        connected.store(true, Ordering::Relaxed);
                        loop_metrics.set_mqtt_connected(true);
                        for topic in &subscriptions {
                            if let Err(e) = sub_client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                warn!(topic = %topic, error = %e, "mqtt_subscribe_failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_incoming(&publish.topic, &publish.payload, &events, &loop_metrics);
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_puback");
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        debug!("mqtt_suback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected.swap(false, Ordering::Relaxed) {
                            warn!(error = %e, "mqtt_disconnected");
                        } else {
                            debug!(error = %e, "mqtt_connect_failed");
                        }
                        loop_metrics.set_mqtt_connected(false);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            rx,
            command_topic: config.mqtt_command_topic(),
            publish_timeout: config.mqtt_publish_timeout(),
            metrics,
        }
    }

    /// Publish reports until shutdown, then drain what is queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(topic = %self.command_topic, "mqtt_publisher_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_publisher_shutdown");
                        while let Ok(report) = self.rx.try_recv() {
                            self.publish_report(report).await;
                        }
                        return;
                    }
                }
                report = self.rx.recv() => {
                    let Some(report) = report else { return };
                    self.publish_report(report).await;
                }
            }
        }
    }

    async fn publish_report(&self, report: OutboundReport) {
        let publish = self.client.publish(
            self.command_topic.as_str(),
            QoS::AtLeastOnce,
            false,
            report.json.into_bytes(),
        );

        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(())) => {
                self.metrics.record_mqtt_published();
                info!(
                    transit_id = %report.transit_id,
                    direction = %report.direction,
                    tags = report.tag_count,
                    "report_published"
                );
            }
            Ok(Err(e)) => {
                self.metrics.record_mqtt_publish_failed();
                error!(transit_id = %report.transit_id, error = %e, "report_publish_failed");
            }
            Err(_) => {
                self.metrics.record_mqtt_publish_failed();
                error!(
                    transit_id = %report.transit_id,
                    timeout_ms = self.publish_timeout.as_millis() as u64,
                    "report_publish_timeout"
                );
            }
        }
    }
}
