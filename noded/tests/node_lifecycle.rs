#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use noded_client::{ClientError, IoListener};
use noded_common::protocol::{ReattachRequest, TaskExit};
use noded_common::{Message, ReturnCode};
use tokio::time::sleep;

use common::{Node, Options};

const WAIT: Duration = Duration::from_secs(10);

fn task_exit(message: &Message) -> Option<&TaskExit> {
    match message {
        Message::TaskExit(exit) => Some(exit),
        _ => None,
    }
}

fn epilog_complete(job_id: u32) -> impl FnMut(&Message) -> bool {
    move |m| matches!(m, Message::EpilogComplete(c) if c.job_id == job_id)
}

#[tokio::test]
async fn simple_launch_reports_exit_and_leaves_registry() {
    let node = Node::start(Options::default()).await;
    let client_endpoint = noded_client::MessageListener::bind(common::KEY.as_bytes().to_vec())
        .await
        .expect("client listener");

    let request = node.launch(7, &["/bin/true"], &client_endpoint.endpoint());
    let info = node.client.launch(request).await.expect("launch");
    assert_eq!(info.pids.len(), 1);
    assert_eq!(info.global_task_ids, vec![0]);
    assert!(info.session_id > 0);

    let exit = client_endpoint
        .wait_for(WAIT, |m| task_exit(m).is_some())
        .await
        .expect("task exit");
    let exit = task_exit(&exit.message).expect("task exit body");
    assert_eq!((exit.job_id, exit.step_id), (7, 1));
    assert_eq!(exit.global_task_ids, vec![0]);
    assert_eq!(exit.status, 0);

    let deadline = Instant::now() + WAIT;
    loop {
        if !node.registered_steps().await.contains(&(7, 1)) {
            break;
        }
        assert!(Instant::now() < deadline, "step 7.1 never left the registry");
        sleep(Duration::from_millis(200)).await;
    }
    node.stop().await;
}

#[tokio::test]
async fn failing_prolog_refuses_the_launch() {
    let node = Node::start(Options {
        prolog: Some("exit 1".into()),
        ..Options::default()
    })
    .await;
    let marker = node.dir.path().join("ran");
    let argv = ["/bin/sh", "-c", &format!("touch {}", marker.display())];
    let request = node.launch(7, &argv, &node.controller.endpoint());

    let err = node.client.launch(request).await.unwrap_err();
    assert!(matches!(err, ClientError::Refused(ReturnCode::PrologFailed)));

    let report = node
        .controller
        .wait_for(WAIT, |m| {
            matches!(m, Message::NodeRegistration(r)
                if r.status == ReturnCode::PrologFailed && r.job_id == Some(7))
        })
        .await;
    assert!(report.is_some(), "no prolog failure registration");
    sleep(Duration::from_millis(300)).await;
    assert!(!marker.exists(), "task ran despite the failed prolog");

    // The failed launch left the job unseen: a retry runs the prolog again
    // and a kill finds nothing to do.
    let retry = node.launch(7, &argv, &node.controller.endpoint());
    let err = node.client.launch(retry).await.unwrap_err();
    assert!(matches!(err, ClientError::Refused(ReturnCode::PrologFailed)));
    assert!(!marker.exists(), "retry skipped the prolog");
    assert_eq!(
        node.client.kill_job(7).await.expect("kill"),
        ReturnCode::KillJobAlreadyComplete
    );
    node.stop().await;
}

#[tokio::test]
async fn second_step_waits_for_the_job_prolog() {
    let node = Node::start(Options {
        prolog: Some("sleep 2; touch \"$(dirname \"$0\")/prolog.done\"".into()),
        ..Options::default()
    })
    .await;
    let done = node.dir.path().join("prolog.done");
    let ordered = node.dir.path().join("ordered");
    let check = format!("test -e {} && touch {}", done.display(), ordered.display());
    let first = node.launch_step(7, 1, &["/bin/true"], &node.controller.endpoint());
    let second = node.launch_step(7, 2, &["/bin/sh", "-c", &check], &node.controller.endpoint());

    let (a, b) = tokio::join!(node.client.launch(first), async {
        sleep(Duration::from_millis(300)).await;
        node.client.launch(second).await
    });
    a.expect("first step");
    b.expect("second step");

    let deadline = Instant::now() + WAIT;
    while !ordered.exists() {
        assert!(Instant::now() < deadline, "second step ran before the prolog finished");
        sleep(Duration::from_millis(100)).await;
    }
    node.stop().await;
}

#[tokio::test]
async fn failed_prolog_refuses_steps_that_waited_for_it() {
    let node = Node::start(Options {
        prolog: Some("sleep 2; exit 1".into()),
        ..Options::default()
    })
    .await;
    let marker = node.dir.path().join("ran");
    let touch = format!("touch {}", marker.display());
    let argv = ["/bin/sh", "-c", touch.as_str()];
    let first = node.launch_step(7, 1, &argv, &node.controller.endpoint());
    let second = node.launch_step(7, 2, &argv, &node.controller.endpoint());

    let (a, b) = tokio::join!(node.client.launch(first), async {
        sleep(Duration::from_millis(300)).await;
        node.client.launch(second).await
    });
    assert!(matches!(a, Err(ClientError::Refused(ReturnCode::PrologFailed))));
    assert!(matches!(b, Err(ClientError::Refused(ReturnCode::PrologFailed))));
    sleep(Duration::from_millis(300)).await;
    assert!(!marker.exists(), "a step ran despite the failed prolog");
    assert!(node.registered_steps().await.is_empty());
    node.stop().await;
}

#[tokio::test]
async fn kill_during_prolog_leaves_no_tasks_behind() {
    let node = Node::start(Options {
        prolog: Some("sleep 2".into()),
        ..Options::default()
    })
    .await;
    let pid_file = node.dir.path().join("task.pid");
    let body = format!("echo $$ > {}; exec sleep 30", pid_file.display());
    let request = node.launch(7, &["/bin/sh", "-c", &body], &node.controller.endpoint());

    let (launched, killed) = tokio::join!(node.client.launch(request), async {
        sleep(Duration::from_millis(700)).await;
        node.client.kill_job(7).await
    });
    assert_eq!(killed.expect("kill"), ReturnCode::Ok);
    assert!(matches!(
        launched,
        Err(ClientError::Refused(ReturnCode::InvalidCredential))
    ));

    let deadline = Instant::now() + WAIT;
    while node.registered_steps().await.contains(&(7, 1)) {
        assert!(Instant::now() < deadline, "step 7.1 never left the registry");
        sleep(Duration::from_millis(200)).await;
    }
    if let Ok(pid) = std::fs::read_to_string(&pid_file) {
        let pid: i32 = pid.trim().parse().expect("task pid");
        let deadline = Instant::now() + WAIT;
        while common::process_alive(pid) {
            assert!(Instant::now() < deadline, "task {pid} survived the kill");
            sleep(Duration::from_millis(100)).await;
        }
    }
    node.stop().await;
}

#[tokio::test]
async fn kill_job_escalates_and_reports_the_epilog_once() {
    let node = Node::start(Options {
        epilog: Some("exit 0".into()),
        kill_wait_secs: 2,
        ..Options::default()
    })
    .await;
    let request = node.launch(
        7,
        &["/bin/sh", "-c", "trap '' TERM; while :; do sleep 1; done"],
        &node.controller.endpoint(),
    );
    node.client.launch(request).await.expect("launch");

    let started = Instant::now();
    assert_eq!(node.client.kill_job(7).await.expect("kill"), ReturnCode::Ok);
    assert!(started.elapsed() < Duration::from_secs(1), "kill reply was not immediate");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(node.client.kill_job(7).await.expect("second kill"), ReturnCode::Ok);

    let exit = node
        .controller
        .wait_for(WAIT, |m| task_exit(m).is_some())
        .await
        .expect("task exit");
    let status = task_exit(&exit.message).expect("task exit body").status;
    assert_eq!(status & 0x7f, 9, "task should die by SIGKILL");
    assert!(started.elapsed() >= Duration::from_secs(2));

    let complete = node
        .controller
        .wait_for(WAIT, epilog_complete(7))
        .await
        .expect("epilog completion");
    match complete.message {
        Message::EpilogComplete(c) => assert_eq!(c.return_code, 0),
        _ => unreachable!(),
    }
    assert!(
        node.controller
            .wait_for(Duration::from_secs(1), epilog_complete(7))
            .await
            .is_none(),
        "epilog reported twice"
    );

    // Revoked by the kill: the job cannot launch again.
    let again = node.launch(7, &["/bin/true"], &node.controller.endpoint());
    let err = node.client.launch(again).await.unwrap_err();
    assert!(matches!(err, ClientError::Refused(ReturnCode::InvalidCredential)));
    node.stop().await;
}

#[tokio::test]
async fn reattached_client_receives_output() {
    let node = Node::start(Options::default()).await;
    let first = IoListener::bind().await.expect("io listener");
    let mut request = node.launch(7, &["/bin/cat"], &node.controller.endpoint());
    request.io_endpoint = Some(first.endpoint().expect("endpoint"));
    let signature = request.credential.signature.clone();
    node.client.launch(request).await.expect("launch");

    let mut a = first.accept(WAIT).await.expect("first stdio connection");
    assert_eq!(a.header().map(|h| (h.job_id, h.step_id)), Some((7, 1)));
    a.write_stdin(b"one\n").await.expect("stdin");
    assert_eq!(a.read_line(WAIT).await.expect("read").as_deref(), Some("one"));

    let second = IoListener::bind().await.expect("io listener");
    let reattach = ReattachRequest {
        job_id: 7,
        step_id: 1,
        signature: "forged".into(),
        io_endpoint: second.endpoint().expect("endpoint"),
        reply_endpoint: node.controller.endpoint(),
    };
    let err = node.client.reattach(reattach.clone()).await.unwrap_err();
    assert!(matches!(err, ClientError::Refused(ReturnCode::InvalidCredential)));

    let info = node
        .client
        .reattach(ReattachRequest {
            signature,
            ..reattach
        })
        .await
        .expect("reattach");
    assert_eq!(info.pids.len(), 1);

    let mut b = second.accept(WAIT).await.expect("second stdio connection");
    b.write_stdin(b"two\n").await.expect("stdin");
    assert_eq!(b.read_line(WAIT).await.expect("read").as_deref(), Some("two"));
    assert_eq!(a.read_line(WAIT).await.expect("read").as_deref(), Some("two"));

    assert_eq!(node.client.kill_job(7).await.expect("kill"), ReturnCode::Ok);
    node.controller
        .wait_for(WAIT, |m| task_exit(m).is_some())
        .await
        .expect("task exit");
    node.stop().await;
}

#[tokio::test]
async fn full_registry_refuses_and_forgets_the_job() {
    let node = Node::start(Options {
        max_steps: 2,
        ..Options::default()
    })
    .await;
    for job_id in [1, 2] {
        let request = node.launch(job_id, &["/bin/sleep", "30"], &node.controller.endpoint());
        node.client.launch(request).await.expect("launch");
    }

    let third = node.launch(3, &["/bin/sleep", "30"], &node.controller.endpoint());
    let err = node.client.launch(third).await.unwrap_err();
    assert!(matches!(err, ClientError::Refused(ReturnCode::TooManySteps)));

    // Nothing cached for job 3: a kill finds nothing to do.
    assert_eq!(
        node.client.kill_job(3).await.expect("kill"),
        ReturnCode::KillJobAlreadyComplete
    );
    for job_id in [1, 2] {
        assert_eq!(node.client.kill_job(job_id).await.expect("kill"), ReturnCode::Ok);
    }
    node.stop().await;
}

#[tokio::test]
async fn admin_requests_and_pid_lookup() {
    let node = Node::start(Options::default()).await;
    let request = node.launch(9, &["/bin/sleep", "30"], &node.controller.endpoint());
    let info = node.client.launch(request).await.expect("launch");

    assert_eq!(node.client.pid_to_job(info.pids[0]).await.expect("lookup"), Some(9));
    assert_eq!(node.client.pid_to_job(std::process::id() as i32).await.expect("lookup"), None);

    assert_eq!(node.client.update_time(9, Some(60)).await.expect("update"), ReturnCode::Ok);
    assert_eq!(
        node.client.update_time(10, Some(60)).await.expect("update"),
        ReturnCode::InvalidJobId
    );
    assert_eq!(node.client.signal_tasks(9, 1, 0).await.expect("liveness check"), ReturnCode::Ok);
    assert_eq!(node.client.reconfigure().await.expect("reconfigure"), ReturnCode::Ok);
    assert_eq!(node.client.ping().await.expect("ping"), ReturnCode::Ok);

    assert_eq!(node.client.signal_tasks(9, 1, 9).await.expect("kill"), ReturnCode::Ok);
    node.controller
        .wait_for(WAIT, |m| task_exit(m).is_some())
        .await
        .expect("task exit");
    node.stop().await;
}
