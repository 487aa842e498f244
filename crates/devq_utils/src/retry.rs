use std::{future::Future, time::Duration};

use crate::decay::ExpDecay;

/// Runs `operation` until it succeeds, or until `max_attempts` attempts have failed, waiting
/// between attempts as told by `decay`. Returns the last error if every attempt failed.
///
/// `operation` is passed the 1-indexed attempt number.
pub async fn async_retry_n<O, R, E, F>(
    max_attempts: usize,
    mut decay: ExpDecay,
    operation: O,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
    O: Fn(usize) -> F,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e);
                }
                tokio::time::sleep(decay.next_duration()).await;
            }
        }
    }
}
