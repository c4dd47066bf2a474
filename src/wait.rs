// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Jitter and periodic loop helpers.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Returns a duration between `duration` and `duration * (1 + max_factor)`.
///
/// A negative `max_factor` is treated as `1.0`. A zero factor returns
/// `duration` unchanged.
pub fn jitter(duration: Duration, max_factor: f64) -> Duration {
    let max_factor = if max_factor < 0.0 { 1.0 } else { max_factor };
    let factor: f64 = rand::thread_rng().gen_range(0.0..1.0);
    duration + Duration::from_secs_f64(duration.as_secs_f64() * factor * max_factor)
}

/// Runs `f` immediately and then once per `period` until `token` is cancelled.
///
/// A run that is in progress when the token fires is allowed to finish.
pub async fn until<F, Fut>(period: Duration, token: CancellationToken, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if token.is_cancelled() {
            return;
        }
        f().await;
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(250);
        for factor in [0.5, 1.0, 2.5] {
            for _ in 0..100 {
                let d = jitter(base, factor);
                assert!(d >= base);
                assert!(d <= base.mul_f64(1.0 + factor));
            }
        }
    }

    #[test]
    fn test_jitter_zero_factor_is_identity() {
        let base = Duration::from_secs(1);
        for _ in 0..100 {
            assert_eq!(jitter(base, 0.0), base);
        }
    }

    #[test]
    fn test_jitter_negative_factor_defaults_to_one() {
        let base = Duration::from_secs(1);
        for _ in 0..100 {
            let d = jitter(base, -0.5);
            assert!(d >= base && d <= base * 2);
        }
    }

    #[test]
    fn test_jitter_zero_duration() {
        assert_eq!(jitter(Duration::ZERO, 1.0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_stops_on_cancel() {
        let token = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let task = {
            let token = token.clone();
            let runs = runs.clone();
            tokio::spawn(until(Duration::from_secs(30), token, move || {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            }))
        };

        tokio::time::sleep(Duration::from_secs(95)).await;
        token.cancel();
        task.await.unwrap();

        // t=0, 30, 60, 90
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }
}
