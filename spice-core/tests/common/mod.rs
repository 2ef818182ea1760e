//! Scripted fake SPICE server for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use serde::Serialize;
use spice_core::capabilities::Capabilities;
use spice_core::header::{DataHeader, HEADER_SIZE};
use spice_core::link::{
    LinkHeader, LinkMess, LinkReply, PUB_KEY_SIZE, TICKET_SIZE, TicketSealer,
};
use spice_core::{ClientEvent, SpiceError, protocol};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const STEP: Duration = Duration::from_secs(5);

/// Pads the password into a ticket instead of encrypting it.
pub struct PlainSealer;

impl TicketSealer for PlainSealer {
    fn seal(&self, _pub_key: &[u8], password: &str) -> Result<Vec<u8>, SpiceError> {
        let mut ticket = password.as_bytes().to_vec();
        ticket.resize(TICKET_SIZE, 0);
        Ok(ticket)
    }
}

pub async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// One accepted, linked channel connection seen from the server side.
pub struct ServerConn {
    pub stream: TcpStream,
    pub link: LinkMess,
    pub ticket: Vec<u8>,
    serial: u64,
}

/// Accept a connection and read the client's link request.
async fn accept_mess(listener: &TcpListener) -> (TcpStream, LinkMess) {
    let (mut stream, _) = tokio::time::timeout(STEP, listener.accept())
        .await
        .expect("no connection")
        .unwrap();
    let mut head = [0u8; LinkHeader::SIZE];
    stream.read_exact(&mut head).await.unwrap();
    let header = LinkHeader::decode(&head).unwrap();
    let mut body = vec![0u8; header.size as usize];
    stream.read_exact(&mut body).await.unwrap();
    (stream, LinkMess::decode(&body).unwrap())
}

async fn write_reply(stream: &mut TcpStream, error: u32) {
    let reply = LinkReply {
        error,
        pub_key: vec![0u8; PUB_KEY_SIZE],
        caps: Capabilities::default(),
    }
    .encode()
    .unwrap();
    let mut out = protocol::encode(&LinkHeader::new(reply.len() as u32)).unwrap();
    out.extend(reply);
    stream.write_all(&out).await.unwrap();
}

/// Accept and complete one link.
pub async fn accept(listener: &TcpListener) -> ServerConn {
    let (mut stream, link) = accept_mess(listener).await;
    write_reply(&mut stream, 0).await;
    let mut ticket = vec![0u8; TICKET_SIZE];
    stream.read_exact(&mut ticket).await.unwrap();
    stream.write_all(&0u32.to_le_bytes()).await.unwrap();
    ServerConn {
        stream,
        link,
        ticket,
        serial: 0,
    }
}

/// Accept a connection and refuse its link with `error`.
pub async fn refuse(listener: &TcpListener, error: u32) -> LinkMess {
    let (mut stream, link) = accept_mess(listener).await;
    write_reply(&mut stream, error).await;
    link
}

impl ServerConn {
    pub async fn send(&mut self, msg_type: u16, body: &[u8]) {
        self.serial += 1;
        let header = DataHeader {
            serial: self.serial,
            msg_type,
            size: body.len() as u32,
            sub_list: 0,
        };
        let mut out = header.encode().to_vec();
        out.extend_from_slice(body);
        self.stream.write_all(&out).await.unwrap();
    }

    pub async fn send_encoded<T: Serialize>(&mut self, msg_type: u16, body: &T) {
        let body = protocol::encode(body).unwrap();
        self.send(msg_type, &body).await;
    }

    /// Next message from the client as `(serial, type, body)`.
    pub async fn recv(&mut self) -> (u64, u16, Vec<u8>) {
        tokio::time::timeout(STEP, async {
            let mut head = [0u8; HEADER_SIZE];
            self.stream.read_exact(&mut head).await.unwrap();
            let header = DataHeader::decode(&head).unwrap();
            let mut body = vec![0u8; header.size as usize];
            self.stream.read_exact(&mut body).await.unwrap();
            (header.serial, header.msg_type, body)
        })
        .await
        .expect("no message from client")
    }

    /// Skip client messages until one of type `msg_type` arrives.
    pub async fn recv_type(&mut self, msg_type: u16) -> Vec<u8> {
        loop {
            let (_, ty, body) = self.recv().await;
            if ty == msg_type {
                return body;
            }
        }
    }

    /// Every message the client writes until it closes its end, as
    /// `(type, body)`.
    pub async fn recv_until_closed(&mut self) -> Vec<(u16, Vec<u8>)> {
        tokio::time::timeout(STEP, async {
            let mut seen = Vec::new();
            loop {
                let mut head = [0u8; HEADER_SIZE];
                if self.stream.read_exact(&mut head).await.is_err() {
                    return seen;
                }
                let header = DataHeader::decode(&head).unwrap();
                let mut body = vec![0u8; header.size as usize];
                if self.stream.read_exact(&mut body).await.is_err() {
                    return seen;
                }
                seen.push((header.msg_type, body));
            }
        })
        .await
        .expect("client kept the connection open")
    }

    /// Wait for the client to close its end.
    pub async fn expect_closed(&mut self) {
        let mut buf = [0u8; 256];
        tokio::time::timeout(STEP, async {
            loop {
                match self.stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await
        .expect("client kept the connection open");
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(STEP, rx.recv())
        .await
        .expect("no client event")
        .expect("event stream closed")
}

/// Poll `f` until it holds.
pub async fn eventually(mut f: impl FnMut() -> bool) {
    tokio::time::timeout(STEP, async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}
