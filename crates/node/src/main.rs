mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{format_environment, ClimateSim, Scenario};

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Split a comma-separated topic list, dropping blanks.
fn parse_topics(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Device command payloads: `"1"`/`"0"`, or `ON`/`OFF`.
fn parse_command(payload: &[u8]) -> Option<bool> {
    match String::from_utf8_lossy(payload).trim().to_ascii_uppercase().as_str() {
        "1" | "ON" => Some(true),
        "0" | "OFF" => Some(false),
        _ => None,
    }
}

/// A command received for one of this node's devices.
#[derive(Debug)]
struct Actuation {
    topic: String,
    on: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env_or("MQTT_HOST", "127.0.0.1");
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let node_id = env_or("NODE_ID", "greenhouse-a");
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    let env_topic = env_or("ENV_TOPIC", "env/sensor");
    let nutrient_topic = env_or("NUTRIENT_TOPIC", "sensor/tds");
    let device_topics = parse_topics(&env_or("DEVICE_TOPICS", "device/1/status"));
    let scenario = Scenario::from_str_lossy(&env_or("SIM_SCENARIO", "steady"));
    let diurnal_period_s: f64 = env::var("SIM_DIURNAL_PERIOD_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600.0);

    let client_id = format!("hydro-node-{node_id}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    let (actuation_tx, mut actuation_rx) = mpsc::channel::<Actuation>(16);

    // Event loop: (re)subscribe on every connect, forward device commands.
    let sub_client = client.clone();
    let subscribed = device_topics.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to broker");
                    for topic in &subscribed {
                        let c = sub_client.clone();
                        let t = topic.clone();
                        // Requests only flush while this loop keeps polling.
                        tokio::spawn(async move {
                            if let Err(e) = c.subscribe(&t, QoS::AtLeastOnce).await {
                                warn!(topic = %t, error = %e, "subscribe failed");
                            }
                        });
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => match parse_command(&p.payload) {
                    Some(on) => {
                        let msg = Actuation {
                            topic: p.topic.clone(),
                            on,
                        };
                        if actuation_tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    None => warn!(
                        topic = %p.topic,
                        payload = %String::from_utf8_lossy(&p.payload),
                        "ignoring unknown command"
                    ),
                },
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "broker error, retrying in 2s");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(
        %node_id,
        %scenario,
        %env_topic,
        %nutrient_topic,
        devices = ?device_topics,
        every_s = sample_every_s,
        "simulating greenhouse"
    );

    let mut sim = ClimateSim::new(scenario, diurnal_period_s);
    let mut device_state: HashMap<String, bool> = HashMap::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(sample_every_s.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let s = sim.sample(sample_every_s as f64);
                let env_payload = format_environment(s.temperature, s.humidity);
                let tds_payload = format!("{:.0}", s.tds_ppm);

                for (topic, payload) in [(&env_topic, env_payload), (&nutrient_topic, tds_payload)] {
                    if let Err(e) = client
                        .publish(topic.as_str(), QoS::AtMostOnce, false, payload.into_bytes())
                        .await
                    {
                        warn!(%topic, error = %e, "publish failed");
                    }
                }
                debug!(
                    temperature = s.temperature,
                    humidity = s.humidity,
                    tds = s.tds_ppm,
                    "published sample"
                );
            }
            Some(cmd) = actuation_rx.recv() => {
                info!(topic = %cmd.topic, on = cmd.on, "actuation");
                device_state.insert(cmd.topic, cmd.on);
                sim.set_misting(device_state.values().any(|on| *on));
            }
            _ = &mut shutdown => {
                info!("node stopping");
                break;
            }
        }
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_list_parsing() {
        assert_eq!(
            parse_topics("device/1/status, device/2/status,,"),
            vec!["device/1/status", "device/2/status"]
        );
        assert!(parse_topics(" ").is_empty());
    }

    #[test]
    fn command_parsing() {
        assert_eq!(parse_command(b"1"), Some(true));
        assert_eq!(parse_command(b" off\n"), Some(false));
        assert_eq!(parse_command(b"ON"), Some(true));
        assert_eq!(parse_command(b"toggle"), None);
    }
}
