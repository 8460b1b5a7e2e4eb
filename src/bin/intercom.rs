//! Intercom endpoint demo.
//!
//! Runs a full endpoint on the default audio devices and drives it from
//! stdin. With a peer argument the endpoint dials out; without one it
//! waits for a caller.
//!
//! ```text
//! intercom                  # listen on the default port
//! intercom 192.168.1.40     # dial a peer (default port)
//! intercom 192.168.1.40:7000
//! ```

use anyhow::Result;
use std::io::BufRead;
use std::thread;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_intercom::audio::device::{device_names, CpalCapture, CpalSink};
use lan_intercom::protocol::INTERCOM_PORT;
use lan_intercom::settings::MemoryStore;
use lan_intercom::{CallEngine, CallEvent, IntercomConfig};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting intercom endpoint");

    let peer = std::env::args().nth(1);

    println!("\n=== Audio Devices ===");
    let (inputs, outputs) = device_names();
    for name in &inputs {
        println!("  input:  {name}");
    }
    for name in &outputs {
        println!("  output: {name}");
    }
    println!();

    let config = IntercomConfig {
        device_name: hostname(),
        ..Default::default()
    };

    let engine = CallEngine::new(
        config,
        |handle| Box::new(CpalCapture::new(None, handle)),
        Box::new(CpalSink::new(None)),
        None, // no AEC kernel wired in the demo
        Box::new(MemoryStore::new()),
    )?;

    tracing::info!(port = engine.local_port(), "endpoint listening");

    let events = engine.events();
    thread::spawn(move || {
        for event in events {
            match event {
                CallEvent::State(state) => println!("<< state: {state}"),
                CallEvent::Caller(name) if !name.is_empty() => println!("<< caller: {name}"),
                CallEvent::Hangup(reason) => println!("<< hangup: {reason}"),
                CallEvent::CallFailed(reason) => println!("<< call failed: {reason}"),
                _ => {}
            }
        }
    });

    if let Some(peer) = peer {
        let (host, port) = match peer.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(INTERCOM_PORT)),
            None => (peer.clone(), INTERCOM_PORT),
        };
        tracing::info!("dialing {host}:{port}");
        engine.connect_to(host, port);
    }

    println!("commands: call | stop | answer | decline | toggle | vol <0..1> | gain <db> | quit");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("call") => engine.start(),
            Some("stop") => engine.stop(),
            Some("answer") => engine.answer(),
            Some("decline") => engine.decline(),
            Some("toggle") => engine.toggle(),
            Some("vol") => {
                if let Some(v) = parts.next().and_then(|s| s.parse::<f32>().ok()) {
                    engine.set_volume(v);
                }
            }
            Some("gain") => {
                if let Some(db) = parts.next().and_then(|s| s.parse::<f32>().ok()) {
                    engine.set_mic_gain_db(db);
                }
            }
            Some("quit") | Some("exit") => break,
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }

    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "Intercom".to_string())
}
