// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! One sync: the four-phase caller/listener exchange over a connection.
//!
//! Both sides run the same code; only the negotiation that precedes phase 1
//! differs between caller and listener, so the engine itself is symmetric.

use super::SyncContext;
use crate::comms::Connection;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::wire::{self, TipRecord};
use crate::event::{Event, EventHash};
use crate::stats::SyncTiming;
use crate::sync_manager::SyncOutcome;
use crate::LogMarker;

use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

// Tags inside the phase 4 stream.
pub(crate) const TAG_EVENT: u8 = 0x01;
pub(crate) const TAG_DONE: u8 = 0x00;
pub(crate) const TAG_PADDING: u8 = 0x02;

// Status bits carried ahead of the tip-known bitmap.
const STATUS_PEER_BEHIND: u8 = 0x01;

const PADDING_CHUNK: usize = 64 * 1024;

/// Runs phases 1-5 on an already-negotiated sync.
pub async fn run_sync(
    ctx: &SyncContext,
    conn: &Arc<Connection>,
    caller: bool,
) -> Result<SyncOutcome> {
    let mut timing = SyncTiming::started();
    let bytes_before = conn.bytes_read() + conn.bytes_written();
    let other_id = conn.other_id;
    trace!("{} with {} caller={}", LogMarker::SyncStart, other_id, caller);

    let result = run_phases(ctx, conn, &mut timing).await;

    let bytes_moved = conn.bytes_read() + conn.bytes_written() - bytes_before;
    match result {
        Ok((events_read, events_written)) => {
            timing.mark(); // t5: finalised
            let outcome = SyncOutcome {
                caller,
                other_id,
                events_read,
                events_written,
            };
            ctx.stats.sync_completed(events_read, events_written);
            ctx.manager.sync_done(&outcome);
            debug!(
                "{} with {}: read {} wrote {} at {:.0} B/s",
                LogMarker::SyncComplete,
                other_id,
                events_read,
                events_written,
                timing.bytes_per_second(bytes_moved)
            );
            Ok(outcome)
        }
        Err(err) => {
            if err.is_transport() {
                ctx.stats.sync_interrupted(caller);
                info!("{} with {}: {}", LogMarker::SyncInterrupted, other_id, err);
            }
            Err(err)
        }
    }
}

async fn run_phases(
    ctx: &SyncContext,
    conn: &Arc<Connection>,
    timing: &mut SyncTiming,
) -> Result<(u64, u64)> {
    let mut reader = conn.reader.clone().lock_owned().await;
    let mut writer = conn.writer.clone().lock_owned().await;
    let other_id = conn.other_id;

    // ---- phase 1: tip exchange ----
    let (our_tips, our_min_gens) = {
        let graph = ctx.graph.read().await;
        let tips: Vec<TipRecord> = graph
            .tips()
            .iter()
            .map(|shadow| TipRecord {
                has_parent: shadow.event().creator_seq() > 0,
                hash: *shadow.event().hash(),
                generation: shadow.event().generation(),
            })
            .collect();
        let floor = ctx.oracle.min_generation_non_ancient();
        (tips, vec![floor; ctx.book.len()])
    };
    let mut tips_frame = BytesMut::new();
    wire::write_tips(&mut tips_frame, &our_tips);
    let mut gens_frame = BytesMut::new();
    wire::write_min_gens(&mut gens_frame, &our_min_gens);

    let ((), (peer_tips_frame, peer_gens_frame)) = tokio::try_join!(
        async {
            writer.write_frame(&tips_frame).await?;
            writer.write_frame(&gens_frame).await
        },
        async {
            let tips = reader.read_frame().await?;
            let gens = reader.read_frame().await?;
            Ok((tips, gens))
        }
    )?;
    let peer_tips = wire::read_tips(peer_tips_frame)?;
    let peer_min_gens = wire::read_min_gens(peer_gens_frame)?;
    timing.mark(); // t1
    trace!("{} with {}", LogMarker::TipsExchanged, other_id);

    // ---- phase 2: need calculation ----
    check_cancelled(ctx)?;
    let (bools_for_peer, known_peer_tips) = {
        let graph = ctx.graph.read().await;
        let bools: Vec<bool> = peer_tips.iter().map(|t| graph.contains(&t.hash)).collect();
        let known: Vec<EventHash> = peer_tips
            .iter()
            .filter(|t| graph.contains(&t.hash))
            .map(|t| t.hash)
            .collect();
        (bools, known)
    };
    // tip-generation comparison: a side whose whole tip set sits below the
    // other's ancient floor has fallen behind
    let peer_behind = fallen_behind(&peer_tips, &our_min_gens);
    let we_look_behind = fallen_behind(&our_tips, &peer_min_gens);
    timing.mark(); // t2

    // ---- phase 3: booleans exchange ----
    let mut bools_frame = BytesMut::new();
    bools_frame.put_u8(if peer_behind { STATUS_PEER_BEHIND } else { 0 });
    wire::write_bitmap(&mut bools_frame, &bools_for_peer);

    let ((), mut peer_bools_frame) = tokio::try_join!(
        async { writer.write_frame(&bools_frame).await },
        async { reader.read_frame().await }
    )?;
    if peer_bools_frame.remaining() < 1 {
        return Err(Error::TruncatedRecord(1));
    }
    let peer_status = peer_bools_frame.get_u8();
    if peer_status & STATUS_PEER_BEHIND != 0 {
        ctx.manager.fallen_behind().report_fallen_behind(other_id);
        info!("{} per {}", LogMarker::FallenBehindReported, other_id);
        return Err(Error::FallenBehind);
    }
    if peer_behind {
        // told them; nothing useful left to exchange
        debug!("peer {} has fallen behind our ancient floor", other_id);
        return Err(Error::FallenBehind);
    }
    let peer_knows_ours = wire::read_bitmap(peer_bools_frame)?;
    timing.mark(); // t3
    trace!("{} with {}", LogMarker::BooleansExchanged, other_id);

    // ---- phase 4: interleaved event exchange ----
    check_cancelled(ctx)?;
    let send_list = {
        let graph = ctx.graph.read().await;
        let mut frontier = known_peer_tips;
        frontier.extend(
            our_tips
                .iter()
                .zip(peer_knows_ours.iter())
                .filter(|(_, known)| **known)
                .map(|(tip, _)| tip.hash),
        );
        graph.events_to_send(&frontier, &peer_min_gens)
    };
    let pad_allowed = ctx.config.throttle7 && !we_look_behind && !peer_behind;

    // one writer task per direction; the reader runs inline. I/O errors
    // nested in the writer's result are re-raised flat at the join.
    let writer_task = tokio::spawn(write_events(
        writer,
        send_list,
        pad_allowed,
        ctx.config.clone(),
        ctx.shutdown.clone(),
    ));
    let read_result = read_events(ctx, &mut *reader).await;
    let write_result = crate::error::flatten_task(writer_task.await);
    let events_read = read_result?;
    let events_written = write_result?;
    timing.mark(); // t4
    trace!("{} with {}", LogMarker::EventStreamDone, other_id);

    Ok((events_read, events_written))
}

fn fallen_behind(tips: &[TipRecord], min_gens: &[u64]) -> bool {
    let floor = min_gens.iter().copied().min().unwrap_or(0);
    if floor == 0 {
        return false;
    }
    // no tips at all means a fresh node, which genesis handles, not gossip
    !tips.is_empty() && tips.iter().all(|tip| tip.generation < floor)
}

fn check_cancelled(ctx: &SyncContext) -> Result<()> {
    if *ctx.shutdown.borrow() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

async fn write_events(
    mut writer: tokio::sync::OwnedMutexGuard<
        crate::comms::framing::FramedWriter<tokio::net::tcp::OwnedWriteHalf>,
    >,
    events: Vec<Arc<Event>>,
    pad_allowed: bool,
    config: Arc<Config>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<u64> {
    let mut frame = BytesMut::new();
    let mut event_bytes = 0u64;
    for event in &events {
        if *shutdown.borrow() {
            return Err(Error::Cancelled);
        }
        frame.clear();
        frame.put_u8(TAG_EVENT);
        wire::write_event(&mut frame, event);
        writer.write_frame(&frame).await?;
        event_bytes += frame.len() as u64;
    }

    // padding goes out ahead of the terminating sentinel so the stream
    // stays self-delimiting for the receiver
    if pad_allowed && throttle7_engaged(&config, event_bytes) {
        let budget = (config.throttle7_max_bytes as f64 * config.throttle7_extra) as usize;
        let mut remaining = budget;
        let chunk = vec![0u8; PADDING_CHUNK];
        while remaining > 0 {
            if *shutdown.borrow() {
                return Err(Error::Cancelled);
            }
            let take = remaining.min(PADDING_CHUNK);
            frame.clear();
            frame.put_u8(TAG_PADDING);
            frame.put_slice(&chunk[..take]);
            writer.write_frame(&frame).await?;
            remaining -= take;
        }
    }

    writer.write_frame(&[TAG_DONE]).await?;
    Ok(events.len() as u64)
}

/// A sync that already moved `throttle7_threshold` times the target volume
/// in event bytes is loud enough; only quieter ones get padded.
fn throttle7_engaged(config: &Config, event_bytes: u64) -> bool {
    if config.throttle7_extra <= 0.0 {
        return false;
    }
    (event_bytes as f64) < config.throttle7_max_bytes as f64 * config.throttle7_threshold
}

async fn read_events<R>(
    ctx: &SyncContext,
    reader: &mut crate::comms::framing::FramedReader<R>,
) -> Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut count = 0u64;
    let mut seen_this_sync: HashSet<EventHash> = HashSet::new();
    loop {
        check_cancelled(ctx)?;
        let mut frame = reader.read_frame().await?;
        if frame.remaining() < 1 {
            return Err(Error::TruncatedRecord(1));
        }
        match frame.get_u8() {
            TAG_DONE => return Ok(count),
            TAG_PADDING => continue,
            TAG_EVENT => {
                let event = wire::read_event(frame)?;
                check_topological(ctx, &event, &seen_this_sync).await?;
                let _ = seen_this_sync.insert(*event.hash());
                let _ = ctx
                    .manager
                    .intake_depth()
                    .fetch_add(1, Ordering::Relaxed);
                if ctx.intake_tx.send(Arc::new(event)).await.is_err() {
                    return Err(Error::Cancelled);
                }
                count += 1;
            }
            tag => return Err(Error::UnexpectedFrameTag(tag)),
        }
    }
}

/// Wire order must be a topological extension: both declared parents must
/// already be known (in the graph, earlier in this stream, or ancient).
async fn check_topological(
    ctx: &SyncContext,
    event: &Event,
    seen_this_sync: &HashSet<EventHash>,
) -> Result<()> {
    let graph = ctx.graph.read().await;
    let floor = graph.expired_floor();
    let parents = [
        (event.self_parent_hash(), event.data().self_parent_gen),
        (event.other_parent_hash(), event.data().other_parent_gen),
    ];
    for (declared, claimed_gen) in parents {
        if let Some(hash) = declared {
            let known = seen_this_sync.contains(hash)
                || graph.contains(hash)
                || (claimed_gen.max(0) as u64) < floor;
            if !known {
                return Err(Error::TopologicalViolation);
            }
        }
    }
    Ok(())
}
