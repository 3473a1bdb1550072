// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP servers for the control and judge channels.
//!
//! All connection tasks are thin: they move bytes and decode framing, then
//! hand everything to the single engine task over a channel. Judge readers
//! run the packet parser and forward completed packets; judge writers drain
//! a per-connection byte channel (dropping the channel closes the
//! connection's write side, which is how the engine disconnects a
//! misbehaving judge). Control connections speak newline-delimited JSON,
//! one request per line, answered in order.

use std::net::SocketAddr;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, instrument, warn};
use tundra_protocol::PacketParser;

use crate::config::Config;
use crate::engine::{Engine, EngineMsg};

/// Open the ledger, replay history, bind both listeners, and run the engine
/// loop until the message channel closes or a fatal store/replay error.
pub async fn run(config: Config) -> Result<()> {
    let engine = Engine::open(&config.data_prefix, config.judge_key.clone())?;
    let (tx, rx) = mpsc::unbounded_channel();

    let control = TcpListener::bind(config.control_addr).await?;
    info!(addr = %config.control_addr, "control channel listening");
    let judges = TcpListener::bind(config.judge_addr).await?;
    info!(addr = %config.judge_addr, "judge channel listening");

    tokio::spawn(run_control_listener(control, tx.clone()));
    tokio::spawn(run_judge_listener(judges, tx));

    engine_loop(engine, rx).await
}

/// Drain engine messages forever. Fatal errors (store I/O, replay
/// inconsistency) abort the process rather than let memory and log diverge.
async fn engine_loop(
    mut engine: Engine,
    mut rx: mpsc::UnboundedReceiver<EngineMsg>,
) -> Result<()> {
    while let Some(msg) = rx.recv().await {
        engine.handle(msg)?;
    }
    Ok(())
}

async fn run_judge_listener(listener: TcpListener, tx: mpsc::UnboundedSender<EngineMsg>) {
    let mut next_conn: u64 = 0;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                next_conn += 1;
                tokio::spawn(handle_judge(next_conn, stream, peer, tx.clone()));
            }
            Err(e) => {
                error!(error = %e, "judge accept failed");
                return;
            }
        }
    }
}

#[instrument(skip(stream, tx), fields(remote = %peer))]
async fn handle_judge(
    conn: u64,
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<EngineMsg>,
) {
    info!(conn, "judge peer connected");
    let (read, write) = stream.into_split();

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Bytes>();
    if tx
        .send(EngineMsg::JudgeConnected { conn, tx: out_tx })
        .is_err()
    {
        return;
    }
    let writer = tokio::spawn(write_judge(write, out_rx));

    read_judge(conn, read, &tx).await;

    let _ = tx.send(EngineMsg::JudgeClosed { conn });
    writer.abort();
    info!(conn, "judge peer disconnected");
}

async fn read_judge(conn: u64, mut read: OwnedReadHalf, tx: &mpsc::UnboundedSender<EngineMsg>) {
    let mut parser = PacketParser::new();
    let mut buf = [0u8; 4096];
    loop {
        match read.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                parser.feed(&buf[..n]);
                for packet in parser.drain() {
                    if tx.send(EngineMsg::JudgePacket { conn, packet }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(conn, error = %e, "judge read failed");
                return;
            }
        }
    }
}

async fn write_judge(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    // The engine dropping the sender ends this task; the write half drops
    // with it and the peer sees the connection close.
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = write.write_all(&chunk).await {
            warn!(error = %e, "judge write failed");
            return;
        }
    }
}

async fn run_control_listener(listener: TcpListener, tx: mpsc::UnboundedSender<EngineMsg>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_control(stream, peer, tx.clone()));
            }
            Err(e) => {
                error!(error = %e, "control accept failed");
                return;
            }
        }
    }
}

#[instrument(skip(stream, tx), fields(remote = %peer))]
async fn handle_control(
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<EngineMsg>,
) {
    info!("control peer connected");
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "control read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let result = match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(request) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx
                    .send(EngineMsg::Control {
                        request,
                        reply: reply_tx,
                    })
                    .is_err()
                {
                    break;
                }
                match reply_rx.await {
                    Ok(result) => result,
                    Err(_) => break,
                }
            }
            Err(e) => {
                warn!(error = %e, "undecodable control request");
                serde_json::Value::Bool(false)
            }
        };
        let mut response = result.to_string();
        response.push('\n');
        if write.write_all(response.as_bytes()).await.is_err() {
            break;
        }
    }
    info!("control peer disconnected");
}
