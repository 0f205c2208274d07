use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::foundation::error::{ComposeError, ComposeResult};
use crate::transport::{Communicator, RequestId, Tag};

const GATHER_TAG: Tag = 2500;

struct Envelope {
    from: usize,
    tag: Tag,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<Vec<Envelope>>,
    ready: Condvar,
}

impl Mailbox {
    // A poisoned lock means a peer thread panicked; the queue itself is
    // still a plain Vec, so keep going with its contents.
    fn lock(&self) -> MutexGuard<'_, Vec<Envelope>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Vec<Envelope>>) -> MutexGuard<'a, Vec<Envelope>> {
        self.ready.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(&self, env: Envelope) {
        self.lock().push(env);
        self.ready.notify_all();
    }
}

/// An in-process cluster: one mailbox per rank, shared by the
/// [`LocalComm`] endpoints handed to worker threads.
///
/// Delivery is buffered (sends never block) and FIFO per sender and tag,
/// which matches the ordering contract of [`Communicator`].
pub struct LocalCluster {
    mailboxes: Vec<Arc<Mailbox>>,
}

impl LocalCluster {
    /// Create a cluster of `num_ranks` processes.
    pub fn new(num_ranks: usize) -> Self {
        Self {
            mailboxes: (0..num_ranks).map(|_| Arc::new(Mailbox::default())).collect(),
        }
    }

    /// The communicator endpoint for `rank`. Endpoints are meant to move
    /// into their rank's thread.
    pub fn comm(&self, rank: usize) -> LocalComm {
        assert!(rank < self.mailboxes.len(), "rank out of range");
        LocalComm {
            rank,
            mailboxes: self.mailboxes.clone(),
            requests: Vec::new(),
        }
    }
}

enum Request {
    SendDone,
    Recv { from: usize, tag: Tag },
    Consumed,
}

/// One rank's endpoint of a [`LocalCluster`].
pub struct LocalComm {
    rank: usize,
    mailboxes: Vec<Arc<Mailbox>>,
    requests: Vec<Request>,
}

impl LocalComm {
    fn check_peer(&self, peer: usize) -> ComposeResult<()> {
        if peer >= self.mailboxes.len() {
            return Err(ComposeError::transport(format!(
                "peer rank {peer} out of range for {} ranks",
                self.mailboxes.len()
            )));
        }
        Ok(())
    }

    fn push_request(&mut self, request: Request) -> RequestId {
        self.requests.push(request);
        RequestId(self.requests.len() - 1)
    }

    /// Wait until a request in `slots` completes; return its slot index and
    /// payload.
    fn wait_any_inner(
        &mut self,
        slots: &mut [Option<RequestId>],
    ) -> ComposeResult<(usize, Option<Vec<u8>>)> {
        if slots.iter().all(Option::is_none) {
            return Err(ComposeError::transport("wait with no active requests"));
        }

        // Sends complete immediately in a buffered transport.
        for i in 0..slots.len() {
            if let Some(id) = slots[i]
                && matches!(self.requests[id.0], Request::SendDone)
            {
                self.requests[id.0] = Request::Consumed;
                slots[i] = None;
                return Ok((i, None));
            }
        }

        let mailbox = self.mailboxes[self.rank].clone();
        let mut queue = mailbox.lock();
        loop {
            for i in 0..slots.len() {
                let Some(id) = slots[i] else { continue };
                let &Request::Recv { from, tag } = &self.requests[id.0] else {
                    return Err(ComposeError::transport("waited on a consumed request"));
                };
                if let Some(at) = queue.iter().position(|e| e.from == from && e.tag == tag) {
                    let env = queue.remove(at);
                    self.requests[id.0] = Request::Consumed;
                    slots[i] = None;
                    return Ok((i, Some(env.payload)));
                }
            }
            queue = mailbox.wait(queue);
        }
    }

    fn take_matching(&self, from: usize, tag: Tag) -> Vec<u8> {
        let mailbox = &self.mailboxes[self.rank];
        let mut queue = mailbox.lock();
        loop {
            if let Some(at) = queue.iter().position(|e| e.from == from && e.tag == tag) {
                return queue.remove(at).payload;
            }
            queue = mailbox.wait(queue);
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.mailboxes.len()
    }

    fn isend(&mut self, to: usize, tag: Tag, payload: Vec<u8>) -> ComposeResult<RequestId> {
        self.check_peer(to)?;
        self.mailboxes[to].deliver(Envelope {
            from: self.rank,
            tag,
            payload,
        });
        Ok(self.push_request(Request::SendDone))
    }

    fn irecv(&mut self, from: usize, tag: Tag) -> ComposeResult<RequestId> {
        self.check_peer(from)?;
        Ok(self.push_request(Request::Recv { from, tag }))
    }

    fn wait_any(
        &mut self,
        requests: &mut [Option<RequestId>],
    ) -> ComposeResult<(usize, Option<Vec<u8>>)> {
        self.wait_any_inner(requests)
    }

    fn wait_all(&mut self, requests: &mut [Option<RequestId>]) -> ComposeResult<()> {
        while requests.iter().any(Option::is_some) {
            self.wait_any_inner(requests)?;
        }
        Ok(())
    }

    fn send(&mut self, to: usize, tag: Tag, payload: Vec<u8>) -> ComposeResult<()> {
        self.isend(to, tag, payload).map(|_| ())
    }

    fn recv(&mut self, from: usize, tag: Tag) -> ComposeResult<Vec<u8>> {
        self.check_peer(from)?;
        Ok(self.take_matching(from, tag))
    }

    fn gather(&mut self, root: usize, payload: Vec<u8>) -> ComposeResult<Option<Vec<Vec<u8>>>> {
        self.check_peer(root)?;
        if self.rank != root {
            self.send(root, GATHER_TAG, payload)?;
            return Ok(None);
        }
        let mut collected = Vec::with_capacity(self.num_ranks());
        for r in 0..self.num_ranks() {
            if r == root {
                collected.push(payload.clone());
            } else {
                collected.push(self.take_matching(r, GATHER_TAG));
            }
        }
        Ok(Some(collected))
    }
}
