use tokio::sync::watch;

pub type ShutdownTx = watch::Sender<bool>;
pub type ShutdownRx = watch::Receiver<bool>;

pub fn channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

pub fn request(tx: &ShutdownTx) {
    tx.send_replace(true);
}

/// Resolves once shutdown was requested or every sender is gone. Cancel-safe, so it can sit in
/// a `select!` loop.
pub async fn requested(rx: &mut ShutdownRx) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn resolves_after_request() {
        let (tx, mut rx) = channel();
        let waiter = tokio::spawn(async move { requested(&mut rx).await });
        request(&tx);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("resolved in time")
            .expect("join");
    }

    #[tokio::test]
    async fn resolves_when_sender_dropped() {
        let (tx, mut rx) = channel();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), requested(&mut rx))
            .await
            .expect("resolved in time");
    }
}
