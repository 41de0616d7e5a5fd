//! Injected collaborators: the election service, the membership service, and
//! the peer transport.
//!
//! The replication engine only assumes monotone terms with a single primary
//! per term; how the primary is chosen is not its concern. `LocalNetwork`
//! and `Election` here are complete in-process implementations with
//! link-level fault injection, used by the integration tests and by
//! embedders that run a whole partition group in one process.

use crate::error::{Result, TideError};
use crate::replication::messages::PeerMessage;
use crate::replication::PartitionHandle;
use crate::types::{MemberId, Term, TermInfo};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Delivers typed peer messages. Implementations are free to drop or delay;
/// the engine retries with backoff.
pub trait PeerTransport: Send + Sync {
  fn send(&self, from: &MemberId, to: &MemberId, message: PeerMessage) -> Result<()>;
}

/// Current partition peers.
pub trait Membership: Send + Sync {
  fn peers(&self) -> Vec<MemberId>;
}

/// Client-side lookup of a member's request endpoint.
pub trait EndpointResolver: Send + Sync {
  fn endpoint(&self, member: &MemberId) -> Option<PartitionHandle>;
}

/// Term observations from the election service. Consumers only assume
/// monotone term numbers with a single primary per term; how the primary is
/// chosen is the implementation's concern.
pub trait ElectionObserver: Send + Sync {
  /// Subscribes to term observations. The current term, if any, is
  /// delivered immediately so late subscribers converge.
  fn subscribe(&self) -> Receiver<TermInfo>;

  /// The latest observation, if a term has started.
  fn current(&self) -> Option<TermInfo>;
}

/// Fixed peer set.
#[derive(Debug, Clone)]
pub struct StaticMembership {
  peers: Vec<MemberId>,
}

impl StaticMembership {
  pub fn new(peers: impl IntoIterator<Item = impl Into<MemberId>>) -> Self {
    Self {
      peers: peers.into_iter().map(Into::into).collect(),
    }
  }
}

impl Membership for StaticMembership {
  fn peers(&self) -> Vec<MemberId> {
    self.peers.clone()
  }
}

// ============================================================================
// Election
// ============================================================================

#[derive(Debug, Default)]
struct ElectionInner {
  term: Term,
  primary: Option<MemberId>,
  subscribers: Vec<Sender<TermInfo>>,
}

/// In-process election service: monotone term numbers, one primary per term,
/// broadcast to every subscriber. Tests drive it explicitly via [`elect`].
///
/// [`elect`]: Election::elect
#[derive(Debug, Default)]
pub struct Election {
  inner: Mutex<ElectionInner>,
}

impl ElectionObserver for Election {
  fn subscribe(&self) -> Receiver<TermInfo> {
    let (tx, rx) = unbounded();
    let mut inner = self.inner.lock();
    if let Some(primary) = &inner.primary {
      let _ = tx.send(TermInfo {
        number: inner.term,
        primary: primary.clone(),
      });
    }
    inner.subscribers.push(tx);
    rx
  }

  fn current(&self) -> Option<TermInfo> {
    let inner = self.inner.lock();
    inner.primary.as_ref().map(|primary| TermInfo {
      number: inner.term,
      primary: primary.clone(),
    })
  }
}

impl Election {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Starts the next term with `primary` and broadcasts it.
  pub fn elect(&self, primary: impl Into<MemberId>) -> TermInfo {
    let mut inner = self.inner.lock();
    inner.term += 1;
    let info = TermInfo {
      number: inner.term,
      primary: primary.into(),
    };
    inner.primary = Some(info.primary.clone());
    inner
      .subscribers
      .retain(|subscriber| subscriber.send(info.clone()).is_ok());
    info
  }
}

// ============================================================================
// In-process transport
// ============================================================================

#[derive(Debug, Default)]
struct NetworkInner {
  members: HashMap<MemberId, PartitionHandle>,
  /// Directed blocked links `(from, to)`.
  blocked: HashSet<(MemberId, MemberId)>,
}

/// In-process message fabric between partition peers, with fault injection:
/// individual links can be blocked and members removed entirely.
#[derive(Debug, Default)]
pub struct LocalNetwork {
  inner: RwLock<NetworkInner>,
}

impl LocalNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn register(&self, handle: PartitionHandle) {
    self
      .inner
      .write()
      .members
      .insert(handle.member_id().clone(), handle);
  }

  /// Removes a member from the fabric; peers and clients both lose it.
  pub fn remove(&self, member: &MemberId) {
    self.inner.write().members.remove(member);
  }

  /// Severs the link between `a` and `b` in both directions.
  pub fn block(&self, a: &MemberId, b: &MemberId) {
    let mut inner = self.inner.write();
    inner.blocked.insert((a.clone(), b.clone()));
    inner.blocked.insert((b.clone(), a.clone()));
  }

  /// Restores the link between `a` and `b`.
  pub fn unblock(&self, a: &MemberId, b: &MemberId) {
    let mut inner = self.inner.write();
    inner.blocked.remove(&(a.clone(), b.clone()));
    inner.blocked.remove(&(b.clone(), a.clone()));
  }

  /// Severs every link touching `member`.
  pub fn isolate(&self, member: &MemberId) {
    let mut inner = self.inner.write();
    let others: Vec<MemberId> = inner
      .members
      .keys()
      .filter(|other| *other != member)
      .cloned()
      .collect();
    for other in others {
      inner.blocked.insert((member.clone(), other.clone()));
      inner.blocked.insert((other, member.clone()));
    }
  }

  /// Restores every link touching `member`.
  pub fn heal(&self, member: &MemberId) {
    self
      .inner
      .write()
      .blocked
      .retain(|(a, b)| a != member && b != member);
  }

  /// Client-side lookup of a member's endpoint. Peer-link blocks do not
  /// affect clients; removal does.
  pub fn client(&self, member: &MemberId) -> Option<PartitionHandle> {
    self.inner.read().members.get(member).cloned()
  }
}

impl EndpointResolver for LocalNetwork {
  fn endpoint(&self, member: &MemberId) -> Option<PartitionHandle> {
    self.client(member)
  }
}

impl PeerTransport for LocalNetwork {
  fn send(&self, from: &MemberId, to: &MemberId, message: PeerMessage) -> Result<()> {
    let inner = self.inner.read();
    if inner.blocked.contains(&(from.clone(), to.clone())) {
      return Err(TideError::Unavailable(format!("link {from} -> {to} is down")));
    }
    let handle = inner
      .members
      .get(to)
      .ok_or_else(|| TideError::Unavailable(format!("member {to} is not reachable")))?;
    handle.deliver_peer(message)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn election_terms_are_monotone_and_broadcast() {
    let election = Election::new();
    let observer = election.subscribe();

    let first = election.elect("a");
    let second = election.elect("b");
    assert!(second.number > first.number);

    assert_eq!(observer.try_recv().expect("first"), first);
    assert_eq!(observer.try_recv().expect("second"), second);

    // A late subscriber still learns the current truth.
    let late = election.subscribe();
    assert_eq!(late.try_recv().expect("latest"), second);
  }
}
