// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP transport for ISO-on-TCP.
//!
//! One [`PlcTransport`] owns one socket for its whole life; the dispatcher
//! is the only task holding one. Receive is TPKT-length framed: exactly four
//! header bytes, then `len - 4` body bytes, short reads looping until the
//! frame is complete.

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::S7Error,
    frames::tpkt::{TPKT_LEN, TpktHeader},
};

/// ISO-TSAP server port.
pub const ISO_TCP_PORT: u16 = 102;

pub(crate) async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T, S7Error>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(S7Error::Cancelled),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(S7Error::Timeout(label)),
            }
        }
    }
}

/// Fast-fail gate before a handshake attempt: a TCP connect to the ISO-TSAP
/// port bounded by `probe_timeout`. ICMP echo needs raw-socket privileges,
/// so the connect fallback is the probe.
pub async fn probe_reachable(ip: Ipv4Addr, port: u16, probe_timeout: Duration) -> bool {
    let addr = SocketAddr::from((ip, port));
    matches!(timeout(probe_timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

#[derive(Debug)]
pub struct PlcTransport {
    stream: TcpStream,
    io_timeout: Duration,
}

impl PlcTransport {
    /// Open a fresh socket to `ip:102` with the session socket options:
    /// keep-alive on, NODELAY on, send/receive buffers sized to twice the
    /// PDU length that will be requested.
    pub async fn connect(
        ip: Ipv4Addr,
        port: u16,
        io_timeout: Duration,
        pdu_hint: u16,
        cancel: &CancellationToken,
    ) -> Result<Self, S7Error> {
        let socket = TcpSocket::new_v4()?;
        socket.set_keepalive(true)?;
        let buffer = 2 * pdu_hint as u32;
        socket.set_recv_buffer_size(buffer)?;
        socket.set_send_buffer_size(buffer)?;

        let addr = SocketAddr::from((ip, port));
        let stream =
            io_with_timeout("tcp connect", socket.connect(addr), io_timeout, cancel)
                .await?;
        stream.set_nodelay(true)?;
        stream.set_linger(None)?;
        debug!("connected to {addr}");

        Ok(PlcTransport { stream, io_timeout })
    }

    /// Write a complete frame.
    pub async fn send_all(
        &mut self,
        frame: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), S7Error> {
        io_with_timeout(
            "socket send",
            self.stream.write_all(frame),
            self.io_timeout,
            cancel,
        )
        .await
    }

    /// Receive one TPKT-framed message, header included.
    pub async fn recv_tpkt_frame(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<BytesMut, S7Error> {
        let mut buf = BytesMut::zeroed(TPKT_LEN);
        io_with_timeout(
            "socket recv (TPKT header)",
            self.stream.read_exact(&mut buf[..TPKT_LEN]),
            self.io_timeout,
            cancel,
        )
        .await?;

        let frame_len = TpktHeader::parse(&buf)?.frame_len();
        let body_len = frame_len - TPKT_LEN;
        if body_len > 0 {
            buf.resize(frame_len, 0);
            io_with_timeout(
                "socket recv (TPKT body)",
                self.stream.read_exact(&mut buf[TPKT_LEN..frame_len]),
                self.io_timeout,
                cancel,
            )
            .await?;
        }
        Ok(buf)
    }

    /// One request/response round-trip. Returns the full response frame and
    /// the wall time of each half.
    pub async fn exchange(
        &mut self,
        frame: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(BytesMut, Duration, Duration), S7Error> {
        let started = tokio::time::Instant::now();
        self.send_all(frame, cancel).await?;
        let sent_at = started.elapsed();
        let response = self.recv_tpkt_frame(cancel).await?;
        let recv_took = started.elapsed() - sent_at;
        Ok((response, sent_at, recv_took))
    }
}
