//! Per-identifier connection-manager state machine.
//!
//! | event            | side    | action                                   |
//! |------------------|---------|------------------------------------------|
//! | `AddrResolved`   | active  | build connection, resolve route          |
//! | `RouteResolved`  | active  | connect                                  |
//! | `ConnectRequest` | passive | build connection, accept                 |
//! | `Established`    | both    | mark connected; active sends descriptor  |
//! | `Disconnected`   | both    | peer lost                                |
//!
//! Anything else ends the round with [`RdsmError::UnexpectedEvent`].

use super::bootstrap::Round;
use super::connection::{Connection, LinkSpec};
use super::node::{Cluster, Link};
use crate::error::{RdsmError, Result};
use crate::transport::fabric::{CmChannel, CmEvent, CmEventKind, CmId, ConnParams, Fabric};
use crate::types::Role;
use std::sync::Arc;
use std::time::Instant;

/// What a round's event loop does next.
enum Step<F: Fabric> {
    Continue,
    Established(Arc<Connection<F>>),
}

impl<F: Fabric> Cluster<F> {
    /// Listen for the lower-indexed `round.peer` and accept its link.
    pub(super) fn accept_link(&self, round: Round) -> Result<Arc<Connection<F>>> {
        let addr = self
            .config
            .listen_addr(self.addresses.self_index(), round.peer);
        let mut channel = self.fabric.listen(addr)?;
        tracing::debug!(peer = round.peer, %addr, "listening");

        let deadline = Instant::now() + self.config.dial_retry_window;
        let mut pending = None;
        loop {
            self.stop.check()?;
            let Some(event) = channel.next_event(self.config.poll_tick)? else {
                if Instant::now() >= deadline {
                    self.abandon(&mut pending);
                    return Err(RdsmError::HandshakeTimeout {
                        peer: round.peer,
                        timeout_ms: self.config.dial_retry_window.as_millis() as u64,
                    });
                }
                continue;
            };
            match self.on_event(round, event, &mut pending) {
                Ok(Step::Continue) => {}
                Ok(Step::Established(conn)) => {
                    self.keep_link(channel, Arc::clone(&conn))?;
                    return Ok(conn);
                }
                Err(e) => {
                    self.abandon(&mut pending);
                    return Err(e);
                }
            }
        }
    }

    /// Dial the higher-indexed `round.peer`, retrying while it is not
    /// listening yet.
    pub(super) fn dial_link(&self, round: Round) -> Result<Arc<Connection<F>>> {
        let addr = self
            .config
            .listen_addr(round.peer, self.addresses.self_index());
        let deadline = Instant::now() + self.config.dial_retry_window;
        let mut attempt = 0u32;

        'dial: loop {
            let mut channel = self.fabric.dial(addr, self.config.resolve_timeout)?;
            let mut pending = None;
            loop {
                self.stop.check()?;
                let Some(event) = channel.next_event(self.config.poll_tick)? else {
                    if Instant::now() >= deadline {
                        self.abandon(&mut pending);
                        return Err(RdsmError::Rejected { addr });
                    }
                    continue;
                };
                if event.kind.is_dial_failure() {
                    self.abandon(&mut pending);
                    if Instant::now() >= deadline {
                        return Err(RdsmError::Rejected { addr });
                    }
                    attempt += 1;
                    if attempt == 1 {
                        tracing::warn!(peer = round.peer, %addr, event = ?event.kind, "peer not listening yet, retrying");
                    } else {
                        tracing::debug!(peer = round.peer, attempt, event = ?event.kind, "dial retry");
                    }
                    std::thread::sleep(self.config.poll_tick);
                    continue 'dial;
                }
                match self.on_event(round, event, &mut pending) {
                    Ok(Step::Continue) => {}
                    Ok(Step::Established(conn)) => {
                        self.keep_link(channel, Arc::clone(&conn))?;
                        return Ok(conn);
                    }
                    Err(e) => {
                        self.abandon(&mut pending);
                        return Err(e);
                    }
                }
            }
        }
    }

    fn on_event(
        &self,
        round: Round,
        event: CmEvent<F::Id>,
        pending: &mut Option<Arc<Connection<F>>>,
    ) -> Result<Step<F>> {
        tracing::debug!(peer = round.peer, role = %round.role, event = ?event.kind, "connection-manager event");
        let params = ConnParams::new(self.config.rnr_retry_count);
        match (event.kind, round.role) {
            (CmEventKind::AddrResolved, Role::Active) if pending.is_none() => {
                *pending = Some(self.build_connection(round, event.id.clone())?);
                event.id.resolve_route(self.config.resolve_timeout)?;
            }
            (CmEventKind::RouteResolved, Role::Active) if pending.is_some() => {
                event.id.connect(&params)?;
            }
            (CmEventKind::ConnectRequest, Role::Passive) if pending.is_none() => {
                let conn = self.build_connection(round, event.id.clone())?;
                *pending = Some(conn);
                event.id.accept(&params)?;
            }
            (CmEventKind::Established, role) if pending.is_some() => {
                let conn = pending.take().ok_or(RdsmError::NotReady)?;
                conn.mark_connected();
                if role == Role::Active {
                    conn.start_handshake()?;
                }
                return Ok(Step::Established(conn));
            }
            (CmEventKind::Disconnected, _) => {
                return Err(RdsmError::PeerDisconnected { peer: round.peer });
            }
            (kind, role) => {
                return Err(RdsmError::UnexpectedEvent {
                    event: format!("{kind:?}"),
                    role: role.name(),
                });
            }
        }
        Ok(Step::Continue)
    }

    fn build_connection(&self, round: Round, id: F::Id) -> Result<Arc<Connection<F>>> {
        let ctx = self.contexts.get_or_create(&self.fabric, round.slot, &id)?;
        let region = self.regions.region()?;
        Connection::build(
            &self.fabric,
            &ctx,
            id,
            LinkSpec {
                conn_id: self.next_conn_id(),
                peer: round.peer,
                role: round.role,
            },
            region,
            &self.config,
            Arc::clone(&self.stop),
        )
    }

    /// Drop a half-built connection from its context.
    fn abandon(&self, pending: &mut Option<Arc<Connection<F>>>) {
        if let Some(conn) = pending.take()
            && let Some(ctx) = self.contexts.get(conn.context_slot())
        {
            ctx.detach(conn.conn_id());
        }
    }

    fn keep_link(&self, channel: F::Channel, conn: Arc<Connection<F>>) -> Result<()> {
        self.links
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("links"))?
            .push(Link { channel, conn });
        Ok(())
    }
}
