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

//! One-shot signals shared between tasks.

use tokio_util::sync::CancellationToken;

/// A signal that starts open and is closed exactly once.
///
/// Closing is idempotent and every clone observes the same state, so a gate
/// can be handed to any number of waiters before or after it closes.
#[derive(Clone, Debug, Default)]
pub struct Gate {
    inner: CancellationToken,
}

impl Gate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the gate, releasing every waiter. Closing twice is a no-op.
    pub fn close(&self) {
        self.inner.cancel();
    }

    /// Returns true once the gate has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Waits until the gate is closed.
    pub async fn wait(&self) {
        self.inner.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let gate = Gate::new();
        assert!(!gate.is_closed());

        gate.close();
        gate.close();

        assert!(gate.is_closed());
        gate.wait().await;
    }

    #[tokio::test]
    async fn test_waiters_released_by_clone() {
        let gate = Gate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };

        gate.clone().close();
        waiter.await.unwrap();
    }
}
