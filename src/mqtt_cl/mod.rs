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

pub mod client;
pub mod client_error;
pub mod client_option;
pub mod message_ids;
pub mod packet;
pub mod pump;
pub mod router;
pub mod store;
pub mod token;
pub mod transport;

pub use client::{AsyncClient, Client, Payload, NETWORK_ERROR_SENTINEL};
pub use client_error::ClientError;
pub use client_option::{
    ClientOptions, ClientOptionsBuilder, ConnectHandler, ConnectionLostHandler, CustomDialer,
    DialFuture, ReconnectHandler,
};
pub use packet::{ConnectReturnCode, LastWill, Packet, ProtocolVersion, QoS};
pub use router::{Message, MessageHandler};
pub use store::{MemoryStore, Store};
pub use token::Token;
pub use transport::{TransportError, TransportOps, TransportRead, TransportWrite};
