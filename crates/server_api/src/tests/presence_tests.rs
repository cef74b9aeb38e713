use super::*;

fn channel(capacity: usize) -> (SessionSender, mpsc::Receiver<ServerEvent>) {
    mpsc::channel(capacity)
}

fn connected(user_id: UserId) -> ServerEvent {
    ServerEvent::Connected { user_id }
}

#[tokio::test]
async fn second_session_survives_first_unregister() {
    let presence = PresenceRegistry::new();
    let alice = UserId(1);
    let (first, second) = (SessionHandle::new(), SessionHandle::new());
    let (tx, _rx) = channel(4);

    presence.register(alice, first, tx.clone()).await;
    presence.register(alice, second, tx).await;
    assert_eq!(presence.sessions_of(alice).await.len(), 2);

    assert_eq!(presence.unregister(first).await, Some(alice));
    let remaining = presence.sessions_of(alice).await;
    assert_eq!(remaining, HashSet::from([second]));
    assert!(presence.is_online(alice).await);

    presence.unregister(second).await;
    assert!(presence.sessions_of(alice).await.is_empty());
    assert!(!presence.is_online(alice).await);
    assert!(presence.online_users().await.is_empty());
}

#[tokio::test]
async fn double_unregister_is_a_noop() {
    let presence = PresenceRegistry::new();
    let (alice, bob) = (UserId(1), UserId(2));
    let (a_session, b_session) = (SessionHandle::new(), SessionHandle::new());
    let (tx, _rx) = channel(4);

    presence.register(alice, a_session, tx.clone()).await;
    presence.register(bob, b_session, tx).await;

    assert_eq!(presence.unregister(a_session).await, Some(alice));
    assert_eq!(presence.unregister(a_session).await, None);
    assert_eq!(presence.unregister(SessionHandle::new()).await, None);

    assert_eq!(presence.sessions_of(bob).await, HashSet::from([b_session]));
    assert_eq!(presence.online_users().await, vec![bob]);
}

#[tokio::test]
async fn reregistering_a_handle_moves_it_between_users() {
    let presence = PresenceRegistry::new();
    let handle = SessionHandle::new();
    let (tx, _rx) = channel(4);

    presence.register(UserId(1), handle, tx.clone()).await;
    presence.register(UserId(2), handle, tx).await;

    assert!(!presence.is_online(UserId(1)).await);
    assert_eq!(presence.sessions_of(UserId(2)).await, HashSet::from([handle]));
}

#[tokio::test]
async fn deliver_reaches_every_session_of_the_user() {
    let presence = PresenceRegistry::new();
    let alice = UserId(1);
    let (tx_a, mut rx_a) = channel(4);
    let (tx_b, mut rx_b) = channel(4);
    presence.register(alice, SessionHandle::new(), tx_a).await;
    presence.register(alice, SessionHandle::new(), tx_b).await;

    assert_eq!(presence.deliver(alice, &connected(alice)).await, 2);
    assert_eq!(rx_a.try_recv().expect("a"), connected(alice));
    assert_eq!(rx_b.try_recv().expect("b"), connected(alice));

    assert_eq!(presence.deliver(UserId(99), &connected(alice)).await, 0);
}

#[tokio::test]
async fn slow_or_closed_session_does_not_block_siblings() {
    let presence = PresenceRegistry::new();
    let alice = UserId(1);

    let (full_tx, _full_rx) = channel(1);
    full_tx.try_send(connected(alice)).expect("fill queue");
    let (closed_tx, closed_rx) = channel(4);
    drop(closed_rx);
    let (live_tx, mut live_rx) = channel(4);

    presence.register(alice, SessionHandle::new(), full_tx).await;
    presence.register(alice, SessionHandle::new(), closed_tx).await;
    presence.register(alice, SessionHandle::new(), live_tx).await;

    assert_eq!(presence.deliver(alice, &connected(alice)).await, 1);
    assert_eq!(live_rx.try_recv().expect("live"), connected(alice));
}

#[test]
fn push_classifies_failures() {
    let handle = SessionHandle::new();
    let (tx, rx) = mpsc::channel(1);
    push(handle, &tx, connected(UserId(1))).expect("first push");
    assert_eq!(
        push(handle, &tx, connected(UserId(1))),
        Err(DeliveryError::Backpressure(handle))
    );
    drop(rx);
    assert_eq!(
        push(handle, &tx, connected(UserId(1))),
        Err(DeliveryError::Closed(handle))
    );
}

#[tokio::test]
async fn concurrent_register_and_unregister_leave_no_residue() {
    let presence = PresenceRegistry::new();
    let (tx, _rx) = channel(1);

    let mut tasks = Vec::new();
    for n in 0..64 {
        let presence = presence.clone();
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            let user = UserId(n % 4);
            let handle = SessionHandle::new();
            presence.register(user, handle, tx).await;
            tokio::task::yield_now().await;
            presence.unregister(handle).await;
            presence.unregister(handle).await;
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }

    assert!(presence.online_users().await.is_empty());
}
