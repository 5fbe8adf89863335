mod common;

use std::sync::Arc;

use common::*;
use rvoip_sip_transport::Transport;
use rvoip_transaction_core::message::{create_ack, create_response};
use rvoip_transaction_core::prelude::*;
use tokio::runtime::Handle;

fn manager() -> TransactionManager {
    init_logging();
    TransactionManager::new(TransactionConfig::default(), Handle::current())
}

fn answer(request: &SipMessage, status: u16) -> SipMessage {
    let mut response = create_response(request, status, None);
    if status > 100 {
        response.set_to_tag("b0b");
    }
    response
}

#[tokio::test(start_paused = true)]
async fn non_invite_retransmits_then_completes() {
    let manager = manager();
    let (conn, link) = connection(Transport::Udp);
    let client = Arc::new(RecordingClient::default());

    let tx = manager
        .send_request(outbound(Method::Options, "opt@host"), conn.clone(), client.clone())
        .unwrap();
    let sent_request = sent(&link).remove(0);
    let via = sent_request.top_via().unwrap();
    assert!(via.is_rfc3261_branch());
    assert_eq!(via.transport, Transport::Udp);
    assert_eq!(conn.references(), 1);

    // T1 doubling: 0.5s, then 1.5s, then 3.5s
    advance(600).await;
    assert_eq!(link.sent_count(), 1);
    advance(1000).await;
    assert_eq!(link.sent_count(), 2);
    link.take_sent();

    manager.handle_message(answer(&sent_request, 200), &conn);
    assert_eq!(*client.finals.lock(), vec![200]);
    assert_eq!(tx.state(), TransactionState::Completed);

    advance(10_000).await;
    assert!(link.take_sent().is_empty());
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert_eq!(*client.terminated.lock(), 1);
    assert!(manager.is_empty());
    assert_eq!(conn.references(), 0);
}

#[tokio::test(start_paused = true)]
async fn invite_without_answer_times_out_once() {
    let manager = manager();
    let (conn, link) = connection(Transport::Udp);
    let client = Arc::new(RecordingClient::default());

    manager
        .send_request(outbound(Method::Invite, "silent@host"), conn.clone(), client.clone())
        .unwrap();
    advance(31_900).await;
    // 0, 0.5, 1.5, 3.5, 7.5, 15.5 and 31.5 seconds
    assert_eq!(link.sent_count(), 7);
    assert_eq!(*client.timeouts.lock(), 0);

    advance(1_000).await;
    assert_eq!(*client.timeouts.lock(), 1);
    assert_eq!(*client.terminated.lock(), 1);
    assert!(manager.is_empty());
}

#[tokio::test(start_paused = true)]
async fn invite_rejection_is_acknowledged_hop_by_hop() {
    let manager = manager();
    let (conn, link) = connection(Transport::Udp);
    let client = Arc::new(RecordingClient::default());

    let tx = manager
        .send_request(outbound(Method::Invite, "busy@host"), conn.clone(), client.clone())
        .unwrap();
    let invite = sent(&link).remove(0);

    manager.handle_message(answer(&invite, 180), &conn);
    assert_eq!(*client.provisionals.lock(), vec![180]);
    assert_eq!(tx.state(), TransactionState::Proceeding);

    // no more retransmissions once a provisional arrived
    advance(5_000).await;
    assert!(link.take_sent().is_empty());

    manager.handle_message(answer(&invite, 486), &conn);
    let ack = sent(&link).remove(0);
    assert_eq!(ack.method(), Some(&Method::Ack));
    assert_eq!(ack.top_via().unwrap().branch, invite.top_via().unwrap().branch);
    assert_eq!(ack.cseq(), Some((1, Method::Ack)));
    assert_eq!(ack.to_tag(), Some("b0b"));
    assert_eq!(*client.finals.lock(), vec![486]);

    manager.handle_message(answer(&invite, 486), &conn);
    assert_eq!(sent(&link)[0].method(), Some(&Method::Ack));
    assert_eq!(*client.finals.lock(), vec![486]);

    advance(33_000).await;
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert!(manager.is_empty());
}

#[tokio::test(start_paused = true)]
async fn invite_success_waits_for_the_tu_ack() {
    let manager = manager();
    let (conn, link) = connection(Transport::Tcp);
    let client = Arc::new(RecordingClient::default());

    let tx = manager
        .send_request(outbound(Method::Invite, "ok@host"), conn.clone(), client.clone())
        .unwrap();
    let invite = sent(&link).remove(0);
    assert_eq!(invite.top_via().unwrap().transport, Transport::Tcp);

    // reliable transport: no retransmissions
    advance(2_000).await;
    assert!(link.take_sent().is_empty());

    manager.handle_message(answer(&invite, 200), &conn);
    manager.handle_message(answer(&invite, 200), &conn);
    assert_eq!(*client.finals.lock(), vec![200, 200]);
    assert_eq!(tx.state(), TransactionState::XCompleted);

    let mut ack = create_ack(&invite, &answer(&invite, 200));
    ack.set_header("Via", format!("SIP/2.0/TCP 10.0.0.1:5060;branch={}", "z9hG4bKack2xx"));
    tx.send_ack(ack).unwrap();
    assert_eq!(sent(&link)[0].method(), Some(&Method::Ack));

    manager.handle_message(answer(&invite, 200), &conn);
    assert_eq!(sent(&link)[0].method(), Some(&Method::Ack));
    assert_eq!(client.finals.lock().len(), 2);

    advance(33_000).await;
    assert_eq!(*client.terminated.lock(), 1);
    assert!(manager.is_empty());
    assert_eq!(conn.references(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_runs_its_own_transaction() {
    let manager = manager();
    let (conn, link) = connection(Transport::Udp);
    let client = Arc::new(RecordingClient::default());
    let cancel_client = Arc::new(RecordingClient::default());

    let tx = manager
        .send_request(outbound(Method::Invite, "cancel@host"), conn.clone(), client.clone())
        .unwrap();
    let invite = sent(&link).remove(0);

    // CANCEL only after a provisional
    manager.handle_message(answer(&invite, 180), &conn);
    let cancel_tx = manager.cancel(&tx, cancel_client.clone()).unwrap();
    let cancel = sent(&link).remove(0);
    assert_eq!(cancel.method(), Some(&Method::Cancel));
    assert_eq!(cancel.top_via().unwrap().branch, invite.top_via().unwrap().branch);
    assert_eq!(cancel.cseq(), Some((1, Method::Cancel)));

    manager.handle_message(create_response(&cancel, 200, None), &conn);
    assert_eq!(*cancel_client.finals.lock(), vec![200]);
    assert_eq!(cancel_tx.state(), TransactionState::Completed);

    manager.handle_message(answer(&invite, 487), &conn);
    assert_eq!(*client.finals.lock(), vec![487]);
    assert!(manager.cancel(&tx, cancel_client).is_err());
}

#[tokio::test(start_paused = true)]
async fn send_failure_reports_transport_error() {
    let manager = manager();
    let (conn, link) = connection(Transport::Udp);
    let client = Arc::new(RecordingClient::default());
    link.set_failing(true);

    let tx = manager
        .send_request(outbound(Method::Message, "fail@host"), conn.clone(), client.clone())
        .unwrap();
    assert_eq!(*client.transport_errors.lock(), 1);
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert_eq!(*client.terminated.lock(), 1);
    assert!(manager.is_empty());
    assert_eq!(conn.references(), 0);
}

#[tokio::test(start_paused = true)]
async fn failover_moves_to_the_next_server() {
    struct Failover {
        next: Arc<rvoip_sip_transport::Connection>,
        finals: parking_lot::Mutex<Vec<u16>>,
    }

    impl ClientTransactionInterface for Failover {
        fn final_response(&self, _tx: &ClientTransaction, response: &SipMessage) {
            self.finals.lock().extend(response.status());
        }

        fn service_unavailable(&self, tx: &ClientTransaction, _response: &SipMessage) {
            tx.next_server(self.next.clone()).unwrap();
        }
    }

    let manager = manager();
    let (first, first_link) = connection(Transport::Udp);
    let (second, second_link) = connection(Transport::Tcp);
    let failover = Arc::new(Failover {
        next: second.clone(),
        finals: Default::default(),
    });

    let tx = manager
        .send_request(outbound(Method::Register, "fo@host"), first.clone(), failover.clone())
        .unwrap();
    tx.set_failover(true);
    let register = sent(&first_link).remove(0);

    manager.handle_message(answer(&register, 503), &first);
    assert!(failover.finals.lock().is_empty());
    assert_eq!(second_link.sent_count(), 1);
    assert_eq!(first.references(), 0);
    assert_eq!(second.references(), 1);
    assert!(Arc::ptr_eq(&tx.connection(), &second));

    manager.handle_message(answer(&register, 200), &second);
    assert_eq!(*failover.finals.lock(), vec![200]);
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert_eq!(second.references(), 0);
}

#[tokio::test(start_paused = true)]
async fn ack_cannot_start_a_transaction() {
    let manager = manager();
    let (conn, _link) = connection(Transport::Udp);
    let result = manager.send_request(
        outbound(Method::Ack, "ack@host"),
        conn,
        Arc::new(RecordingClient::default()),
    );
    assert!(result.is_err());
}
