use std::time::Duration;

use frontier_transitions::compositor::{LayerContent, Rect};
use frontier_transitions::origin::OriginClass;
use frontier_transitions::pipeline::{BrowsingContext, IncomingDocument, LoadEvent};
use frontier_transitions::transition::{CancelReason, NavigationReason, Phase, WindowProxyState};
use frontier_transitions::{DocumentId, ScriptTransitionListener, TransitionConfig};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::LocalSet;
use tokio::time::sleep;
use url::Url;

fn url(raw: &str) -> Url {
    Url::parse(raw).expect("valid url")
}

fn page(script: &str) -> (BrowsingContext, ScriptTransitionListener) {
    let context = BrowsingContext::new(
        &TransitionConfig::default(),
        IncomingDocument {
            id: DocumentId(1),
            url: url("https://example.com/"),
        },
    );
    let listener = ScriptTransitionListener::new(context.queue()).expect("script listener");
    context.controller().add_listener(listener.clone());
    listener
        .eval("globalThis.log = [];", "log.js")
        .expect("init log");
    listener.eval(script, "page.js").expect("page script");
    (context, listener)
}

fn fetch(events: Vec<(u64, LoadEvent)>) -> UnboundedReceiver<LoadEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::task::spawn_local(async move {
        for (delay, event) in events {
            sleep(Duration::from_millis(delay)).await;
            if tx.send(event).is_err() {
                return;
            }
        }
    });
    rx
}

fn response(raw: &str) -> LoadEvent {
    LoadEvent::Response(IncomingDocument {
        id: DocumentId(2),
        url: url(raw),
    })
}

fn read_log(listener: &ScriptTransitionListener) -> String {
    listener
        .eval_with("log.join('|')", "read-log.js")
        .expect("read log")
}

#[tokio::test(start_paused = true)]
async fn test_transition_until_timer_keeps_old_document() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut context, listener) = page(
                r#"
                addEventListener('navigationtransition', (event) => {
                    log.push(event.type + ':' + event.reason + ':' + event.url);
                    event.transitionUntil(new Promise((resolve) => {
                        setTimeout(() => {
                            log.push('animation done');
                            resolve();
                        }, 500);
                    }));
                });
                "#,
            );

            let loads = fetch(vec![(100, response("https://example.com/back"))]);
            let summary = context
                .navigate(url("https://example.com/back"), NavigationReason::Back, loads)
                .await
                .expect("navigate");

            assert_eq!(summary.outcome, Phase::Committed);
            assert_eq!(summary.resumed_after_ms, 500);
            assert_eq!(
                read_log(&listener),
                "navigationtransition:back:https://example.com/back|animation done"
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_reentrant_transition_until_from_new_window_continuation() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut context, listener) = page(
                r#"
                onnavigationtransition = (event) => {
                    event.transitionUntil(event.newWindow.then((win) => {
                        log.push('window:' + win.url);
                        event.transitionUntil(new Promise((resolve) => {
                            setTimeout(() => {
                                log.push('second');
                                resolve();
                            }, 300);
                        }));
                    }));
                };
                "#,
            );

            let loads = fetch(vec![(100, response("https://example.com/next"))]);
            let summary = context
                .navigate(url("https://example.com/next"), NavigationReason::Normal, loads)
                .await
                .expect("navigate");

            assert_eq!(summary.outcome, Phase::Committed);
            assert_eq!(summary.window, WindowProxyState::ResolvedSameOrigin);
            assert_eq!(summary.resumed_after_ms, 400);
            assert_eq!(read_log(&listener), "window:https://example.com/next|second");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_cross_origin_redirect_hides_url_and_window() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut context, listener) = page(
                r#"
                addEventListener('navigationtransition', (event) => {
                    log.push('dispatch:' + event.url);
                    event.transitionUntil(event.newWindow.then((win) => {
                        log.push('absent:' + (win === undefined));
                        log.push('later:' + event.url);
                    }));
                });
                "#,
            );

            let loads = fetch(vec![
                (50, LoadEvent::Redirect(url("https://auth.elsewhere.test/login"))),
                (50, LoadEvent::Redirect(url("https://example.com/home"))),
                (50, response("https://example.com/home")),
            ]);
            let summary = context
                .navigate(url("https://example.com/account"), NavigationReason::Normal, loads)
                .await
                .expect("navigate");

            assert_eq!(summary.window, WindowProxyState::ResolvedUndefined);
            assert_eq!(summary.origin, Some(OriginClass::CrossOrigin));
            assert_eq!(summary.target_url, "");
            assert_eq!(summary.resumed_after_ms, 50);
            assert_eq!(
                read_log(&listener),
                "dispatch:https://example.com/account|absent:true|later:"
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_extension_fails_open() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut context, _listener) = page(
                r#"
                addEventListener('navigationtransition', (event) => {
                    event.transitionUntil(new Promise((resolve) => setTimeout(resolve, 2000)));
                    event.transitionUntil(new Promise((_, reject) => {
                        setTimeout(() => reject(new Error('animation cancelled')), 200);
                    }));
                });
                "#,
            );

            let loads = fetch(vec![(100, response("https://example.com/next"))]);
            let summary = context
                .navigate(url("https://example.com/next"), NavigationReason::Normal, loads)
                .await
                .expect("navigate");

            assert_eq!(summary.outcome, Phase::Failed);
            assert_eq!(summary.resumed_after_ms, 200);
            assert!(summary.switched);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_throwing_listener_does_not_stop_others() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut context, listener) = page(
                r#"
                addEventListener('navigationtransition', () => {
                    throw new Error('broken listener');
                });
                addEventListener('navigationtransition', (event) => {
                    log.push('second listener saw ' + event.reason);
                });
                "#,
            );

            let loads = fetch(vec![(10, response("https://example.com/"))]);
            let summary = context
                .navigate(url("https://example.com/"), NavigationReason::Reload, loads)
                .await
                .expect("navigate");

            assert_eq!(summary.outcome, Phase::Committed);
            assert_eq!(read_log(&listener), "second listener saw reload");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_canceled_navigation_never_settles_new_window() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut context, listener) = page(
                r#"
                addEventListener('navigationtransition', (event) => {
                    event.newWindow.then(
                        () => log.push('resolved'),
                        () => log.push('rejected'),
                    );
                    event.transitionUntil(new Promise((resolve) => setTimeout(resolve, 1000)));
                });
                "#,
            );

            let loads = fetch(vec![(100, LoadEvent::Canceled(CancelReason::Download))]);
            let summary = context
                .navigate(url("https://example.com/archive.zip"), NavigationReason::Normal, loads)
                .await
                .expect("navigate");

            assert_eq!(summary.outcome, Phase::Canceled);
            assert_eq!(summary.window, WindowProxyState::Canceled);
            assert_eq!(summary.resumed_after_ms, 100);

            sleep(Duration::from_millis(2_000)).await;
            assert_eq!(read_log(&listener), "");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_transition_until_after_close_is_ignored() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut context, listener) = page(
                r#"
                addEventListener('navigationtransition', (event) => {
                    globalThis.lastEvent = event;
                });
                "#,
            );

            let loads = fetch(vec![(10, response("https://example.com/next"))]);
            let summary = context
                .navigate(url("https://example.com/next"), NavigationReason::Normal, loads)
                .await
                .expect("navigate");
            assert_eq!(summary.outcome, Phase::Committed);

            let result: String = listener
                .eval_with(
                    "try { lastEvent.transitionUntil(new Promise(() => {})); 'ignored'; } catch (err) { 'threw'; }",
                    "late.js",
                )
                .expect("late registration");
            assert_eq!(result, "ignored");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_script_placeholder_and_offset_paint_before_reveal() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut context, listener) = page(
                r#"
                addEventListener('navigationtransition', (event) => {
                    event.insertPlaceholder('skeleton');
                    event.setZIndex('outgoing', 1);
                    event.setOffset('outgoing', -640, 0);
                    try {
                        event.setOffset('sideways', 0, 0);
                    } catch (err) {
                        log.push(err.name);
                    }
                    event.transitionUntil(new Promise((resolve) => setTimeout(resolve, 300)));
                });
                "#,
            );

            let loads = fetch(vec![(100, response("https://example.com/next"))]);
            let summary = context
                .navigate(url("https://example.com/next"), NavigationReason::Normal, loads)
                .await
                .expect("navigate");
            assert_eq!(summary.outcome, Phase::Committed);
            assert_eq!(read_log(&listener), "TypeError");

            let frames = context.compositor().borrow().paint_log();
            let old = LayerContent::Document(DocumentId(1));
            let new = LayerContent::Document(DocumentId(2));
            let placeholder = LayerContent::Placeholder("skeleton".into());

            let before_reveal = &frames[0];
            assert_eq!(before_reveal.layers[0].content, placeholder);
            assert!(!before_reveal.shows(&new));
            let outgoing = before_reveal.top().expect("outgoing root painted");
            assert_eq!(outgoing.content, old);
            assert_eq!(outgoing.clip, Rect::new(0.0, 0.0, 640.0, 800.0));

            let revealed = frames
                .iter()
                .find(|frame| frame.layers.len() == 2 && frame.shows(&new))
                .expect("incoming revealed while compositing");
            assert!(!revealed.shows(&placeholder));
            assert_eq!(revealed.top().map(|layer| &layer.content), Some(&old));

            let last = frames.last().expect("final frame");
            assert_eq!(last.layers.len(), 1);
            assert_eq!(last.layers[0].content, new);
            assert_eq!(last.layers[0].clip, Rect::new(0.0, 0.0, 1280.0, 800.0));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_event_from_earlier_navigation_cannot_extend_later_one() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut context, listener) = page(
                r#"
                addEventListener('navigationtransition', (event) => {
                    if (globalThis.previous) {
                        log.push('previous:' + previous.url);
                        previous.transitionUntil(new Promise(() => {}));
                        previous.setZIndex('incoming', 5);
                    }
                    globalThis.previous = event;
                });
                "#,
            );

            let loads = fetch(vec![(10, response("https://example.com/one"))]);
            let first = context
                .navigate(url("https://example.com/one"), NavigationReason::Normal, loads)
                .await
                .expect("first navigation");
            assert_eq!(first.outcome, Phase::Committed);

            let loads = fetch(vec![(10, LoadEvent::Response(IncomingDocument {
                id: DocumentId(3),
                url: url("https://example.com/two"),
            }))]);
            let second = context
                .navigate(url("https://example.com/two"), NavigationReason::Normal, loads)
                .await
                .expect("second navigation");

            assert_eq!(second.outcome, Phase::Committed);
            assert!(!second.timed_out);
            assert_eq!(second.resumed_after_ms, 0);
            assert_eq!(second.active_document, DocumentId(3));
            assert_eq!(read_log(&listener), "previous:https://example.com/one");
        })
        .await;
}
