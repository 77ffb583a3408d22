// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::env::args;
use std::process::exit;
use std::sync::Arc;

use tokio::sync::mpsc;
use xmpp_connection::connect::SocketConnector;
use xmpp_connection::{
    ConnectionConfiguration, Error, Session, SessionStatus, StreamElement,
};

/// Prints what the server says and forwards it to `main`.
struct PrintingSession {
    domain: String,
    events: mpsc::UnboundedSender<Result<StreamElement, Error>>,
}

impl Session for PrintingSession {
    fn notify_exception(&self, error: Error) {
        let _ = self.events.send(Err(error));
    }

    fn handle_element(&self, element: StreamElement) -> bool {
        let _ = self.events.send(Ok(element));
        false
    }

    fn domain(&self) -> &str {
        &self.domain
    }

    fn status(&self) -> SessionStatus {
        SessionStatus::Connected
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = args().collect();
    if args.len() != 2 {
        println!("Usage: {} <domain>", args[0]);
        exit(1);
    }
    let domain = &args[1];

    let config = match ConnectionConfiguration::builder(domain.as_str()).build() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            println!("Invalid configuration: {}", e);
            exit(1);
        }
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session: Arc<dyn Session> = Arc::new(PrintingSession {
        domain: domain.clone(),
        events: tx,
    });

    let connection = match SocketConnector::new(config)
        .connect(Arc::downgrade(&session))
        .await
    {
        Ok(connection) => connection,
        Err(e) => {
            println!("Connecting to {} failed: {}", domain, e);
            exit(1);
        }
    };
    connection.open().await.unwrap();

    while let Some(event) = rx.recv().await {
        match event {
            Ok(StreamElement::Open(header)) => println!("Stream opened: {:?}", header),
            Ok(StreamElement::Features(features)) => {
                println!(
                    "Features (secure: {}, compressed: {}, generation {}):",
                    connection.is_secure(),
                    connection.is_compressed(),
                    connection.channel_generation()
                );
                for feature in features.0.children() {
                    println!("- {} ({})", feature.name(), feature.ns());
                }
                break;
            }
            Ok(other) => println!("Received {}", other.describe()),
            Err(e) => {
                println!("Connection failed: {}", e);
                exit(1);
            }
        }
    }

    connection.close().await.unwrap();
}
