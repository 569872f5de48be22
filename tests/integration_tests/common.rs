// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! An in-process fake PLC good enough for the protocol engine: ISO
//! handshake, CommSetup, single-item ReadVar/WriteVar against a byte-array
//! memory image, chunked SZL answers and PI start/stop echoes.

use std::{collections::HashMap, net::Ipv4Addr, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};

/// Area memory size of the fake image.
const AREA_SIZE: usize = 2048;
/// SZL record bytes served per response frame.
const SZL_CHUNK: usize = 100;

/// One observed variable access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenRequest {
    pub area: u8,
    pub db: u16,
    pub addr: u32,
    pub count: u16,
    pub write: bool,
}

#[derive(Debug, Default)]
pub struct FakeState {
    /// (area code, db) → bytes.
    pub memory: HashMap<(u8, u16), Vec<u8>>,
    /// SZL id → record bytes.
    pub szl: HashMap<u16, Vec<u8>>,
    /// Every variable access in arrival order.
    pub seen: Vec<SeenRequest>,
    /// PDU length the CPU announces at CommSetup.
    pub announced_pdu: u16,
}

pub struct FakePlc {
    pub port: u16,
    pub state: Arc<Mutex<FakeState>>,
}

impl FakePlc {
    pub async fn spawn() -> FakePlc {
        FakePlc::spawn_with_pdu(480).await
    }

    pub async fn spawn_with_pdu(announced_pdu: u16) -> FakePlc {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake PLC");
        let port = listener.local_addr().expect("local addr").port();

        let mut state = FakeState {
            announced_pdu,
            ..FakeState::default()
        };
        state.szl.insert(0x0011, module_id_record());
        state.szl.insert(0x001C, component_id_record());
        state.szl.insert(0x0424, vec![0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00]);
        let state = Arc::new(Mutex::new(state));

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, conn_state).await;
                });
            }
        });

        FakePlc { port, state }
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::LOCALHOST
    }

    /// Write bytes into an area image.
    pub async fn poke(&self, area: u8, db: u16, at: usize, bytes: &[u8]) {
        let mut state = self.state.lock().await;
        let image = state
            .memory
            .entry((area, db))
            .or_insert_with(|| vec![0; AREA_SIZE]);
        image[at..at + bytes.len()].copy_from_slice(bytes);
    }

    pub async fn peek(&self, area: u8, db: u16, at: usize, len: usize) -> Vec<u8> {
        let mut state = self.state.lock().await;
        let image = state
            .memory
            .entry((area, db))
            .or_insert_with(|| vec![0; AREA_SIZE]);
        image[at..at + len].to_vec()
    }

    pub async fn seen(&self) -> Vec<SeenRequest> {
        self.state.lock().await.seen.clone()
    }
}

/// SZL 0x0011: order code at record offset 2..22, three version bytes at
/// the tail.
fn module_id_record() -> Vec<u8> {
    let mut rec = vec![0u8; 32];
    rec[2..22].copy_from_slice(b"6ES7 315-2EH14-0AB0 ");
    rec[29] = 3;
    rec[30] = 2;
    rec[31] = 1;
    rec
}

/// SZL 0x001C: component identification strings at the offsets the client
/// decodes.
fn component_id_record() -> Vec<u8> {
    let mut rec = vec![0u8; 204];
    write_str(&mut rec, 2, b"SIMATIC 300 Station");
    write_str(&mut rec, 36, b"CPU 315-2 PN/DP");
    write_str(&mut rec, 104, b"Original Siemens Equipment");
    write_str(&mut rec, 138, b"S C-X4U421302009");
    write_str(&mut rec, 172, b"CPU 315-2 PN/DP");
    rec
}

fn write_str(buf: &mut [u8], at: usize, s: &[u8]) {
    buf[at..at + s.len()].copy_from_slice(s);
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let len = u16::from_be_bytes([head[2], head[3]]) as usize;
    let mut frame = vec![0u8; len];
    frame[..4].copy_from_slice(&head);
    stream.read_exact(&mut frame[4..]).await?;
    Ok(frame)
}

async fn serve_connection(
    mut stream: TcpStream,
    state: Arc<Mutex<FakeState>>,
) -> std::io::Result<()> {
    // Remaining SZL records of an in-flight chunked answer.
    let mut szl_pending: Option<(Vec<u8>, u8)> = None;

    loop {
        let frame = read_frame(&mut stream).await?;
        let response = if frame.len() >= 6 && frame[5] == 0xE0 {
            // COTP Connection Request → Confirm.
            let mut cc = frame.clone();
            cc[5] = 0xD0;
            cc
        } else if frame.len() >= 18 && frame[8] == 0x01 {
            serve_job(&frame, &state).await
        } else if frame.len() >= 18 && frame[8] == 0x07 {
            serve_userdata(&frame, &state, &mut szl_pending).await
        } else {
            continue;
        };
        stream.write_all(&response).await?;
    }
}

async fn serve_job(frame: &[u8], state: &Arc<Mutex<FakeState>>) -> Vec<u8> {
    match frame[17] {
        0xF0 => {
            let requested = u16::from_be_bytes([frame[23], frame[24]]);
            let announced = state.lock().await.announced_pdu.min(requested);
            comm_setup_ack(announced)
        },
        0x04 => serve_read(frame, state).await,
        0x05 => serve_write(frame, state).await,
        pi @ (0x28 | 0x29) => ack_frame(&[pi, 0x00], &[]),
        other => ack_frame(&[other, 0x00], &[]),
    }
}

/// Decode the single variable specification at offset 19.
fn decode_spec(frame: &[u8]) -> (u8, u16, u8, u32, u16) {
    let transport = frame[22];
    let count = u16::from_be_bytes([frame[23], frame[24]]);
    let db = u16::from_be_bytes([frame[25], frame[26]]);
    let area = frame[27];
    let addr = u32::from_be_bytes([0, frame[28], frame[29], frame[30]]);
    (transport, db, area, addr, count)
}

async fn serve_read(frame: &[u8], state: &Arc<Mutex<FakeState>>) -> Vec<u8> {
    let (transport, db, area, addr, count) = decode_spec(frame);
    let mut state = state.lock().await;
    state.seen.push(SeenRequest {
        area,
        db,
        addr,
        count,
        write: false,
    });
    let image = state
        .memory
        .entry((area, db))
        .or_insert_with(|| vec![0; AREA_SIZE]);

    let mut data = Vec::new();
    match transport {
        0x01 => {
            let byte = (addr / 8) as usize;
            let bit = (addr % 8) as u8;
            let value = image[byte] >> bit & 1;
            data.extend_from_slice(&[0xFF, 0x03, 0x00, 0x01, value]);
        },
        0x1C | 0x1D => {
            let at = addr as usize * 2;
            let len = count as usize * 2;
            data.extend_from_slice(&[0xFF, 0x09]);
            data.extend_from_slice(&(len as u16).to_be_bytes());
            data.extend_from_slice(&image[at..at + len]);
        },
        _ => {
            let at = (addr / 8) as usize;
            let len = count as usize;
            data.extend_from_slice(&[0xFF, 0x04]);
            data.extend_from_slice(&((len * 8) as u16).to_be_bytes());
            data.extend_from_slice(&image[at..at + len]);
        },
    }
    ack_frame(&[0x04, 0x01], &data)
}

async fn serve_write(frame: &[u8], state: &Arc<Mutex<FakeState>>) -> Vec<u8> {
    let (transport, db, area, addr, count) = decode_spec(frame);
    let param_len = u16::from_be_bytes([frame[13], frame[14]]) as usize;
    let data_at = 17 + param_len;
    let payload_len = {
        let bits = u16::from_be_bytes([frame[data_at + 2], frame[data_at + 3]]) as usize;
        match frame[data_at + 1] {
            0x09 => bits,
            0x03 => bits.div_ceil(8),
            _ => bits / 8,
        }
    };
    let payload = &frame[data_at + 4..data_at + 4 + payload_len];

    let mut state = state.lock().await;
    state.seen.push(SeenRequest {
        area,
        db,
        addr,
        count,
        write: true,
    });
    let image = state
        .memory
        .entry((area, db))
        .or_insert_with(|| vec![0; AREA_SIZE]);

    match transport {
        0x01 => {
            let byte = (addr / 8) as usize;
            let bit = (addr % 8) as u8;
            if payload[0] & 1 == 1 {
                image[byte] |= 1 << bit;
            } else {
                image[byte] &= !(1 << bit);
            }
        },
        0x1C | 0x1D => {
            let at = addr as usize * 2;
            image[at..at + payload.len()].copy_from_slice(payload);
        },
        _ => {
            let at = (addr / 8) as usize;
            image[at..at + payload.len()].copy_from_slice(payload);
        },
    }
    ack_frame(&[0x05, 0x01], &[0xFF])
}

async fn serve_userdata(
    frame: &[u8],
    state: &Arc<Mutex<FakeState>>,
    szl_pending: &mut Option<(Vec<u8>, u8)>,
) -> Vec<u8> {
    let param_len = u16::from_be_bytes([frame[13], frame[14]]) as usize;
    if param_len == 8 {
        // Initial SZL request: id and index at fixed offsets.
        let id = u16::from_be_bytes([frame[29], frame[30]]);
        let records = state.lock().await.szl.get(&id).cloned().unwrap_or_default();
        if records.len() > SZL_CHUNK {
            let (head, tail) = records.split_at(SZL_CHUNK);
            *szl_pending = Some((tail.to_vec(), 1));
            szl_frame(true, true, 1, head)
        } else {
            szl_frame(true, false, 0, &records)
        }
    } else {
        // Continuation: serve the next pending chunk.
        match szl_pending.take() {
            Some((remaining, seq)) if remaining.len() > SZL_CHUNK => {
                let (head, tail) = remaining.split_at(SZL_CHUNK);
                *szl_pending = Some((tail.to_vec(), seq + 1));
                szl_frame(false, true, seq + 1, head)
            },
            Some((remaining, seq)) => szl_frame(false, false, seq + 1, &remaining),
            None => szl_frame(false, false, 0, &[]),
        }
    }
}

/// Ack-data response envelope shared by read/write/PI answers.
fn ack_frame(params: &[u8], data: &[u8]) -> Vec<u8> {
    let mut frame = vec![
        0x03, 0x00, 0x00, 0x00, // TPKT, patched below
        0x02, 0xF0, 0x80, // COTP DT
        0x32, 0x03, 0x00, 0x00, 0x00, 0x01, // ack-data header
        0x00, 0x00, // param length, patched below
        0x00, 0x00, // data length, patched below
        0x00, 0x00, // error class/code
    ];
    frame.extend_from_slice(params);
    frame.extend_from_slice(data);
    let total = frame.len() as u16;
    frame[2..4].copy_from_slice(&total.to_be_bytes());
    frame[13..15].copy_from_slice(&(params.len() as u16).to_be_bytes());
    frame[15..17].copy_from_slice(&(data.len() as u16).to_be_bytes());
    frame
}

fn comm_setup_ack(announced: u16) -> Vec<u8> {
    let mut params = vec![0xF0, 0x00, 0x00, 0x01, 0x00, 0x01];
    params.extend_from_slice(&announced.to_be_bytes());
    ack_frame(&params, &[])
}

/// SZL UserData response frame carrying one chunk of records.
fn szl_frame(first: bool, more: bool, seq: u8, records: &[u8]) -> Vec<u8> {
    let list_header = if first { 8 } else { 4 };
    let chunk_len = list_header + records.len();

    let mut frame = vec![
        0x03, 0x00, 0x00, 0x00, // TPKT, patched below
        0x02, 0xF0, 0x80, // COTP DT
        0x32, 0x07, 0x00, 0x00, 0x00, 0x02, // UserData header
        0x00, 0x0C, // param length
        0x00, 0x00, // data length, patched below
    ];
    frame.extend_from_slice(&[
        0x00, 0x01, 0x12, 0x08, 0x12, 0x84, 0x01, seq, 0x00, more as u8, 0x00, 0x00,
    ]);
    frame.push(0xFF);
    frame.push(0x09);
    frame.extend_from_slice(&(chunk_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x1C, 0x00, 0x00]);
    if first {
        frame.extend_from_slice(&[0x00, 0x22, 0x00, 0x01]);
    }
    frame.extend_from_slice(records);

    let total = frame.len() as u16;
    frame[2..4].copy_from_slice(&total.to_be_bytes());
    frame[15..17].copy_from_slice(&((4 + chunk_len) as u16).to_be_bytes());
    frame
}
