use super::{OsgConnection, OsgConnectionPool, OsgPacket, OsgReply, OsgRequest, OsgRequestBody, OsgSeverity};
use crate::common::{Error, Result};
use crate::request::Request;
use std::sync::Arc;

/// One object requested in a packet, with the replies that answered it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsgFetch {
    pub request: OsgRequestBody,
    pub replies: Vec<OsgReply>,
    ended: bool,
}

impl OsgFetch {
    fn new(request: OsgRequestBody) -> Self {
        Self {
            request,
            replies: Vec::new(),
            ended: false,
        }
    }

    pub const fn is_ended(&self) -> bool {
        self.ended
    }
}

/// A failed attempt and whether it ran on a freshly opened connection.
struct AttemptError {
    error: Error,
    fresh: bool,
}

/// Sends packets over the pool and retries channel failures.
///
/// The retry budget is fractional. An attempt on a connection that had
/// already served other packets costs `1 / pool.max_size()`, since a broken
/// pool may hand out every stale connection in turn before a fresh one. An
/// attempt on a fresh connection, or a failed allocation, costs 1. The last
/// attempt is the one made with a budget of at most 1, or after the
/// request's deadline.
pub struct OsgCaller {
    pool: Arc<dyn OsgConnectionPool>,
    retry_count: f64,
}

impl OsgCaller {
    pub fn new(pool: Arc<dyn OsgConnectionPool>, retry_count: f64) -> Self {
        Self { pool, retry_count }
    }

    /// Sends `bodies` as one packet and collects the replies of each.
    /// Blocks until every fetch has seen its end-of-reply.
    pub fn call(&self, request: &Request, bodies: Vec<OsgRequestBody>) -> Result<Vec<OsgFetch>> {
        let hops = request.hops() + 1;
        let mut budget = self.retry_count;
        let mut last_error = Error::ChannelError {
            context: "retry budget exhausted before the first attempt".into(),
        };

        while budget > 0.0 {
            let last_attempt = budget <= 1.0 || request.deadline_passed();
            let connection = match self.pool.allocate() {
                Ok(connection) => connection,
                Err(e) => {
                    if last_attempt {
                        return Err(e);
                    }
                    #[cfg(feature = "tracing")]
                    tracing::warn!(request_id = request.id(), "OSG allocation failed, retrying: {e}");
                    budget -= 1.0;
                    last_error = e;
                    continue;
                }
            };

            let outcome = Self::attempt(connection.as_ref(), hops, &bodies);
            self.pool.release(connection);
            match outcome {
                Ok(fetches) => return Self::check_failed_command(fetches),
                Err(AttemptError { error, fresh }) => {
                    if last_attempt || !error.is_retriable() {
                        return Err(error);
                    }
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        request_id = request.id(),
                        budget,
                        fresh,
                        "OSG exchange failed, retrying: {error}"
                    );
                    budget -= if fresh {
                        1.0
                    } else {
                        1.0 / self.pool.max_size().max(1) as f64
                    };
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    fn attempt(
        connection: &dyn OsgConnection,
        hops: u32,
        bodies: &[OsgRequestBody],
    ) -> core::result::Result<Vec<OsgFetch>, AttemptError> {
        let first_serial = connection.allocate_serial_number();
        let fresh = first_serial <= 1;
        let fail = |error| AttemptError { error, fresh };

        let mut requests = Vec::with_capacity(bodies.len() + 1);
        requests.push(OsgRequest {
            serial: first_serial,
            hops,
            body: OsgRequestBody::Init,
        });
        for body in bodies {
            requests.push(OsgRequest {
                serial: connection.allocate_serial_number(),
                hops,
                body: body.clone(),
            });
        }
        connection.send_packet(&OsgPacket { requests }).map_err(fail)?;

        let mut fetches: Vec<OsgFetch> = bodies.iter().cloned().map(OsgFetch::new).collect();
        let mut open = fetches.len();
        let mut init_done = false;
        while open > 0 || !init_done {
            let reply = connection.receive_reply().map_err(fail)?;
            let index = reply.serial - first_serial;
            if index == 0 {
                init_done |= reply.end_of_reply;
                continue;
            }
            let fetch = usize::try_from(index - 1)
                .ok()
                .and_then(|i| fetches.get_mut(i))
                .ok_or_else(|| {
                    fail(Error::LogicError {
                        message: format!("reply serial {} is outside the batch", reply.serial),
                    })
                })?;
            if fetch.ended {
                return Err(fail(Error::LogicError {
                    message: format!("reply serial {} arrived after its end of reply", reply.serial),
                }));
            }
            if reply.end_of_reply {
                fetch.ended = true;
                open -= 1;
            }
            fetch.replies.push(reply);
        }
        Ok(fetches)
    }

    fn check_failed_command(fetches: Vec<OsgFetch>) -> Result<Vec<OsgFetch>> {
        let failed = fetches
            .iter()
            .flat_map(|f| &f.replies)
            .flat_map(|r| &r.errors)
            .find(|e| e.severity == OsgSeverity::FailedCommand);
        match failed {
            Some(e) => Err(Error::Backend {
                message: format!("OSG command failed: {}", e.message),
            }),
            None => Ok(fetches),
        }
    }
}
