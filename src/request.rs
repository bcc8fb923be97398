//! External requests: SDO and register transfers issued by the application
//! and serviced asynchronously by the master state machine.

use crate::error::Error;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Lifecycle of an external request.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestState {
    /// Created, not yet handed to the master.
    #[default]
    Init,
    /// Waiting in a slave's request queue.
    Queued,
    /// Currently being serviced by a state machine. Can no longer be
    /// cancelled.
    Busy,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failure,
}

/// What a request asks the master to do.
#[derive(Debug, Clone)]
pub(crate) enum RequestOp {
    SdoUpload {
        index: u16,
        sub_index: u8,
        complete_access: bool,
    },
    SdoDownload {
        index: u16,
        sub_index: u8,
        complete_access: bool,
        data: Vec<u8>,
    },
    /// Full object dictionary scan via the SDO information services.
    Dictionary,
    /// Raw register read via FPRD.
    RegRead { address: u16, size: usize },
    /// Raw register write via FPWR.
    RegWrite { address: u16, data: Vec<u8> },
}

#[derive(Debug)]
pub(crate) struct RequestInner {
    pub(crate) op: RequestOp,
    pub(crate) state: RequestState,
    /// Upload/read result data.
    pub(crate) data: Vec<u8>,
    pub(crate) error: Option<Error>,
}

/// A request shared between the issuing thread and the master state machine.
#[derive(Debug)]
pub(crate) struct Request {
    inner: Mutex<RequestInner>,
    done: Condvar,
}

pub(crate) type RequestHandle = Arc<Request>;

impl Request {
    pub(crate) fn new(op: RequestOp) -> RequestHandle {
        Arc::new(Self {
            inner: Mutex::new(RequestInner {
                op,
                state: RequestState::Queued,
                data: Vec::new(),
                error: None,
            }),
            done: Condvar::new(),
        })
    }

    pub(crate) fn state(&self) -> RequestState {
        self.inner.lock().unwrap().state
    }

    /// State machine side: take the request into service.
    ///
    /// Returns the operation to perform, or `None` if the request was
    /// cancelled while still queued.
    pub(crate) fn begin(&self) -> Option<RequestOp> {
        let mut inner = self.inner.lock().unwrap();

        if inner.state != RequestState::Queued {
            return None;
        }

        inner.state = RequestState::Busy;

        Some(inner.op.clone())
    }

    /// State machine side: finish the request and wake all waiters.
    pub(crate) fn complete(&self, result: Result<Vec<u8>, Error>) {
        let mut inner = self.inner.lock().unwrap();

        match result {
            Ok(data) => {
                inner.data = data;
                inner.state = RequestState::Success;
            }
            Err(error) => {
                inner.error = Some(error);
                inner.state = RequestState::Failure;
            }
        }

        self.done.notify_all();
    }

    /// Caller side: withdraw a request that has not been taken into service
    /// yet. A request that is already busy must be waited out.
    pub(crate) fn cancel(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.state != RequestState::Queued {
            return false;
        }

        inner.error = Some(Error::Cancelled);
        inner.state = RequestState::Failure;

        self.done.notify_all();

        true
    }

    /// Caller side: block until the request completes, with an optional
    /// overall timeout.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        let mut inner = self.inner.lock().unwrap();

        loop {
            match inner.state {
                RequestState::Success => return Ok(core::mem::take(&mut inner.data)),
                RequestState::Failure => {
                    return Err(inner.error.unwrap_or(Error::Internal));
                }
                _ => {}
            }

            inner = match timeout {
                Some(timeout) => {
                    let (guard, result) = self.done.wait_timeout(inner, timeout).unwrap();

                    if result.timed_out()
                        && !matches!(
                            guard.state,
                            RequestState::Success | RequestState::Failure
                        )
                    {
                        return Err(Error::Timeout);
                    }

                    guard
                }
                None => self.done.wait(inner).unwrap(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn complete_wakes_waiter() {
        let request = Request::new(RequestOp::SdoUpload {
            index: 0x1018,
            sub_index: 1,
            complete_access: false,
        });

        let waiter = Arc::clone(&request);

        let handle = thread::spawn(move || waiter.wait(Some(Duration::from_secs(5))));

        assert!(request.begin().is_some());
        request.complete(Ok(vec![1, 2, 3, 4]));

        assert_eq!(handle.join().unwrap().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn cancel_only_while_queued() {
        let request = Request::new(RequestOp::RegRead {
            address: 0x0130,
            size: 2,
        });

        let op = request.begin();

        assert!(op.is_some());
        assert!(!request.cancel());

        request.complete(Err(Error::Timeout));

        assert_eq!(
            request.wait(Some(Duration::from_millis(10))),
            Err(Error::Timeout)
        );
    }

    #[test]
    fn cancelled_request_is_not_serviced() {
        let request = Request::new(RequestOp::RegRead {
            address: 0x0130,
            size: 2,
        });

        assert!(request.cancel());
        assert!(request.begin().is_none());
        assert_eq!(request.wait(None), Err(Error::Cancelled));
    }
}
