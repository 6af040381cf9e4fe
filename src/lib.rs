// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! # MQTT Client Tokio
//!
//! An asynchronous MQTT v3.1.1 client for Rust with tokio, supporting TCP,
//! TLS and WebSocket transports, QoS 0/1/2 delivery with persistence-backed
//! session resume, and automatic reconnection.
//!
//! ## Quick Start
//!
//! ```ignore
//! use mqtt_client_tokio::mqtt_cl::{AsyncClient, ClientOptions, QoS};
//! use std::time::Duration;
//!
//! let options = ClientOptions::builder()
//!     .servers(vec!["tcp://127.0.0.1:1883".to_string()])
//!     .client_id("my-client")
//!     .build()?;
//! let client = AsyncClient::new(options);
//!
//! let connect = client.connect().await;
//! connect.wait().await?;
//!
//! client
//!     .subscribe("sensors/+/temp", QoS::AtLeastOnce, Some(std::sync::Arc::new(|msg| {
//!         println!("{}: {:?}", msg.topic, msg.payload);
//!     })))
//!     .await
//!     .wait()
//!     .await?;
//!
//! client.publish("sensors/room1/temp", QoS::AtLeastOnce, false, "21.5")
//!     .await
//!     .wait()
//!     .await?;
//!
//! client.disconnect(Duration::from_millis(250)).await;
//! ```
//!
//! ## Main Components
//!
//! - [`mqtt_cl::client`]: lifecycle, publish/subscribe API, session resume
//! - [`mqtt_cl::transport`]: transport layer implementations (TCP, TLS,
//!   WebSocket) and dial helpers
//! - [`mqtt_cl::client_option`]: connection and behavior configuration
//! - [`mqtt_cl::store`]: persistence interface used to honor QoS 1/2
//!   guarantees across reconnects and restarts
//! - [`mqtt_cl::packet`]: MQTT control packet types and wire codec
//! - [`mqtt_cl::token`]: completion handles for asynchronous operations

pub mod mqtt_cl;
