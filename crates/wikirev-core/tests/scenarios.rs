//! End-to-end pipeline scenarios against a scripted in-memory transport

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indicatif::ProgressBar;
use wikirev_core::{
    ArticleTarget, BackoffConfig, CancelFlag, Endpoint, FetchConfig, FetchError, FetchOutcome,
    FetchRequest, HttpTransport, IssueError, LatestContent, Mode, Orchestrator, RateLimiter,
    ResponseBody, Transport, VerificationFailure,
};
use wikirev_core::pipeline::{PipelineContext, PipelineResult};

type Handler = dyn Fn(&FetchRequest) -> Result<String, IssueError> + Send + Sync;

/// Answers each request from a closure and records what was asked
struct Scripted {
    handler: Box<Handler>,
    calls: Mutex<Vec<FetchRequest>>,
}

impl Scripted {
    fn new(f: impl Fn(&FetchRequest) -> Result<String, IssueError> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(f),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<FetchRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl Transport for Scripted {
    fn execute(&self, request: &FetchRequest) -> Result<ResponseBody, IssueError> {
        self.calls.lock().unwrap().push(request.clone());
        (self.handler)(request).map(ResponseBody::from_bytes)
    }
}

fn fast_config() -> FetchConfig {
    FetchConfig {
        requests_per_second: 1000.0,
        page_size: 2,
        retry_base_ms: 1,
        verify_count: false,
        backoff: BackoffConfig {
            floor_ms: 0,
            ceiling_ms: 50,
            multiplier: 2.0,
            decay_after: 10,
        },
        ..Default::default()
    }
}

fn param<'a>(req: &'a FetchRequest, key: &str) -> Option<&'a str> {
    req.params
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.as_str())
}

fn rvcontinue(req: &FetchRequest) -> Option<&str> {
    req.continuation
        .as_ref()?
        .pairs()
        .iter()
        .find(|(k, _)| k == "rvcontinue")
        .map(|(_, v)| v.as_str())
}

fn revision_json(id: u64) -> String {
    format!(
        r#"{{"revid":{id},"parentid":{},"user":"Editor","userid":1,"timestamp":"2020-01-01T00:00:{:02}Z","slots":{{"main":{{"contentmodel":"wikitext","content":"text of {id}"}}}}}}"#,
        id - 1,
        id % 60
    )
}

fn history_page(title: &str, ids: &[u64], next: Option<&str>) -> String {
    let revs: Vec<String> = ids.iter().map(|&id| revision_json(id)).collect();
    let cont = next
        .map(|t| format!(r#""continue":{{"rvcontinue":"{t}","continue":"||"}},"#))
        .unwrap_or_default();
    format!(
        r#"{{"batchcomplete":{},{cont}"query":{{"pages":[{{"pageid":1,"ns":0,"title":"{title}","revisions":[{}]}}]}}}}"#,
        next.is_none(),
        revs.join(",")
    )
}

/// Pages [10,11], [12,13], [14] keyed by the incoming token
fn five_revisions(req: &FetchRequest) -> Result<String, IssueError> {
    let title = param(req, "titles").unwrap_or("Knower");
    Ok(match rvcontinue(req) {
        None => history_page(title, &[10, 11], Some("20200101000011|12")),
        Some("20200101000011|12") => history_page(title, &[12, 13], Some("20200101000013|14")),
        Some("20200101000013|14") => history_page(title, &[14], None),
        Some(other) => panic!("unexpected token {other}"),
    })
}

fn ids(outcome: &FetchOutcome) -> Vec<u64> {
    outcome
        .history()
        .expect("complete history")
        .revisions
        .iter()
        .map(|r| r.revid)
        .collect()
}

fn title(s: &str) -> ArticleTarget {
    ArticleTarget::Title(s.to_string())
}

fn transient() -> IssueError {
    IssueError::Transient {
        status: None,
        message: "connection reset by peer".to_string(),
    }
}

#[test]
fn three_pages_assemble_in_order() {
    let orch = Orchestrator::new(fast_config(), Scripted::new(five_revisions));
    let report = orch.run(&[title("Knower")]).unwrap();

    let result = &report.results[0];
    assert_eq!(ids(&result.outcome), vec![10, 11, 12, 13, 14]);
    let history = result.outcome.history().unwrap();
    assert_eq!(history.duplicates_dropped, 0);
    assert_eq!(history.display_title(), "Knower");
    assert_eq!(result.pages, 3);
    assert_eq!(orch.transport().calls().len(), 3);
}

#[test]
fn transient_failures_on_page_two_recover() {
    let page_two_attempts = AtomicUsize::new(0);
    let transport = Scripted::new(move |req| {
        if rvcontinue(req) == Some("20200101000011|12")
            && page_two_attempts.fetch_add(1, Ordering::SeqCst) < 2
        {
            return Err(transient());
        }
        five_revisions(req)
    });
    let config = FetchConfig {
        max_retries: 3,
        ..fast_config()
    };
    let orch = Orchestrator::new(config, transport);
    let report = orch.run(&[title("Knower")]).unwrap();

    assert_eq!(ids(&report.results[0].outcome), vec![10, 11, 12, 13, 14]);
    // Retries re-sent the same token
    let calls = orch.transport().calls();
    assert_eq!(calls.len(), 5);
    assert_eq!(calls[1], calls[2]);
    assert_eq!(calls[2], calls[3]);
}

#[test]
fn truncated_page_is_retried_and_deduplicated() {
    let truncated_once = AtomicUsize::new(0);
    let transport = Scripted::new(move |req| {
        let body = five_revisions(req)?;
        if rvcontinue(req) == Some("20200101000011|12")
            && truncated_once.fetch_add(1, Ordering::SeqCst) == 0
        {
            // Cut after revision 12 has been fully delivered
            let cut = body.find(r#"{"revid":13"#).unwrap();
            return Ok(body[..cut].to_string());
        }
        Ok(body)
    });
    let orch = Orchestrator::new(fast_config(), transport);
    let report = orch.run(&[title("Knower")]).unwrap();

    let outcome = &report.results[0].outcome;
    assert_eq!(ids(outcome), vec![10, 11, 12, 13, 14]);
    assert_eq!(outcome.history().unwrap().duplicates_dropped, 1);
}

#[test]
fn retries_exhausted_fails_article() {
    let config = FetchConfig {
        max_retries: 3,
        ..fast_config()
    };
    let orch = Orchestrator::new(config, Scripted::new(|_| Err(transient())));
    let report = orch.run(&[title("Knower")]).unwrap();
    assert!(matches!(
        report.results[0].outcome,
        FetchOutcome::Failed(FetchError::TransientNetwork { attempts: 4, .. })
    ));
    assert_eq!(orch.transport().calls().len(), 4);
}

#[test]
fn count_hint_mismatch_is_incomplete() {
    let transport = Scripted::new(|req| match &req.endpoint {
        // Five revisions [10..=14] have three edits strictly between them;
        // reporting four means the wiki holds one we never saw
        Endpoint::EditCount { from, to, .. } => {
            assert_eq!((*from, *to), (10, 14));
            Ok(r#"{"count":4,"limit":false}"#.to_string())
        }
        Endpoint::Query => five_revisions(req),
    });
    let config = FetchConfig {
        verify_count: true,
        ..fast_config()
    };
    let orch = Orchestrator::new(config, transport);
    let report = orch.run(&[title("Knower")]).unwrap();

    match &report.results[0].outcome {
        FetchOutcome::Failed(FetchError::CompletenessVerification(
            VerificationFailure::CountMismatch {
                expected,
                assembled,
            },
        )) => assert_eq!((*expected, *assembled), (6, 5)),
        other => panic!("expected count mismatch, got {other:?}"),
    }
}

#[test]
fn count_hint_match_completes() {
    let transport = Scripted::new(|req| match &req.endpoint {
        Endpoint::EditCount { title, .. } => {
            assert_eq!(title, "Knower");
            Ok(r#"{"count":3,"limit":false}"#.to_string())
        }
        Endpoint::Query => five_revisions(req),
    });
    let config = FetchConfig {
        verify_count: true,
        ..fast_config()
    };
    let orch = Orchestrator::new(config, transport);
    let report = orch.run(&[title("Knower")]).unwrap();
    let history = report.results[0].outcome.history().unwrap();
    assert_eq!(history.expected_count, Some(5));
}

#[test]
fn unavailable_count_hint_falls_back_to_order_check() {
    let transport = Scripted::new(|req| match &req.endpoint {
        Endpoint::EditCount { .. } => Ok(r#"{"count":10000,"limit":true}"#.to_string()),
        Endpoint::Query => five_revisions(req),
    });
    let config = FetchConfig {
        verify_count: true,
        ..fast_config()
    };
    let orch = Orchestrator::new(config, transport);
    let report = orch.run(&[title("Knower")]).unwrap();
    let history = report.results[0].outcome.history().unwrap();
    assert_eq!(history.expected_count, None);
    assert_eq!(history.revisions.len(), 5);
}

#[test]
fn cancel_between_pages_leaves_finished_article_intact() {
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let transport = Scripted::new(move |req| match param(req, "titles") {
        Some("B") => Ok(history_page("B", &[1, 2], None)),
        Some("A") => {
            // A's first page arrives, then the user hits ^C
            trigger.cancel();
            Ok(history_page("A", &[10, 11], Some("20200101000011|12")))
        }
        other => panic!("unexpected titles {other:?}"),
    });
    let config = FetchConfig {
        concurrency: 1,
        ..fast_config()
    };
    let orch = Orchestrator::new(config, transport).with_cancel(cancel);
    let report = orch.run(&[title("B"), title("A")]).unwrap();

    assert_eq!(ids(&report.results[0].outcome), vec![1, 2]);
    assert!(matches!(
        report.results[1].outcome,
        FetchOutcome::Failed(FetchError::Cancelled)
    ));
    assert_eq!(report.cancelled(), 1);
    // No request for A's second page
    let a_calls = orch
        .transport()
        .calls()
        .iter()
        .filter(|c| param(c, "titles") == Some("A"))
        .count();
    assert_eq!(a_calls, 1);
}

#[test]
fn cancelled_before_start_reports_every_article() {
    let cancel = CancelFlag::new();
    cancel.cancel();
    let orch = Orchestrator::new(fast_config(), Scripted::new(five_revisions)).with_cancel(cancel);
    let report = orch.run(&[title("A"), title("B")]).unwrap();
    assert_eq!(report.cancelled(), 2);
    assert!(orch.transport().calls().is_empty());
}

#[test]
fn not_found_does_not_stop_the_batch() {
    let transport = Scripted::new(|req| match param(req, "titles") {
        Some("Gone") => Ok(r#"{"batchcomplete":true,"query":{"pages":[{"ns":0,"title":"Gone","missing":true}]}}"#.to_string()),
        Some("Deleted") => Err(IssueError::from_status(404, None, "Not Found")),
        _ => five_revisions(req),
    });
    let orch = Orchestrator::new(fast_config(), transport);
    let report = orch
        .run(&[title("Gone"), title("Knower"), title("Deleted")])
        .unwrap();

    assert_eq!(
        report.results[0].outcome.error(),
        Some(&FetchError::NotFound)
    );
    assert_eq!(ids(&report.results[1].outcome), vec![10, 11, 12, 13, 14]);
    assert_eq!(
        report.results[2].outcome.error(),
        Some(&FetchError::NotFound)
    );
    assert_eq!(report.completed(), 1);
    assert!(!report.all_complete());
}

#[test]
fn continuation_token_echoed_verbatim() {
    let odd = "20231231235959|98765 with spaces & symbols=?";
    let transport = Scripted::new(move |req| {
        Ok(match rvcontinue(req) {
            None => history_page("Knower", &[1], Some(odd)),
            Some(t) => {
                assert_eq!(t, odd);
                history_page("Knower", &[2], None)
            }
        })
    });
    let orch = Orchestrator::new(fast_config(), transport);
    orch.run(&[title("Knower")]).unwrap();

    let calls = orch.transport().calls();
    let token = calls[1].continuation.as_ref().unwrap();
    assert_eq!(
        token.pairs(),
        &[
            ("rvcontinue".to_string(), odd.to_string()),
            ("continue".to_string(), "||".to_string()),
        ]
    );
    let pairs = calls[1].query_pairs();
    assert!(pairs.contains(&("rvcontinue", odd)));
}

#[test]
fn repeated_token_stalls() {
    let transport = Scripted::new(|_| Ok(history_page("Knower", &[1], Some("same|1"))));
    let orch = Orchestrator::new(fast_config(), transport);
    let report = orch.run(&[title("Knower")]).unwrap();
    assert_eq!(
        report.results[0].outcome.error(),
        Some(&FetchError::ContinuationStalled { page: 2 })
    );
}

#[test]
fn throttling_widens_spacing_without_spending_retries() {
    let throttles = AtomicUsize::new(0);
    let transport = Scripted::new(move |req| {
        if throttles.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(IssueError::Throttled {
                retry_after: None,
                message: "maxlag".to_string(),
            });
        }
        five_revisions(req)
    });
    let config = FetchConfig {
        max_retries: 0,
        ..fast_config()
    };
    let orch = Orchestrator::new(config, transport);
    let floor = orch.limiter().spacing();
    let report = orch.run(&[title("Knower")]).unwrap();

    assert_eq!(ids(&report.results[0].outcome), vec![10, 11, 12, 13, 14]);
    assert!(orch.limiter().spacing() > floor);
}

#[test]
fn api_maxlag_error_is_throttle() {
    let lagged = AtomicUsize::new(0);
    let transport = Scripted::new(move |req| {
        if lagged.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(
                r#"{"error":{"code":"maxlag","info":"Waiting for db1: 6 seconds lagged"}}"#
                    .to_string(),
            );
        }
        five_revisions(req)
    });
    let orch = Orchestrator::new(fast_config(), transport);
    let report = orch.run(&[title("Knower")]).unwrap();
    assert!(report.all_complete());
    assert_eq!(orch.transport().calls().len(), 4);
}

#[test]
fn rejected_request_is_not_retried() {
    let transport = Scripted::new(|_| {
        Ok(r#"{"error":{"code":"badvalue","info":"Unrecognized value for parameter \"prop\""}}"#.to_string())
    });
    let orch = Orchestrator::new(fast_config(), transport);
    let report = orch.run(&[title("Knower")]).unwrap();
    assert!(matches!(
        report.results[0].outcome.error(),
        Some(FetchError::Rejected { code, .. }) if code == "badvalue"
    ));
    assert_eq!(orch.transport().calls().len(), 1);
}

#[test]
fn latest_mode_batches_and_maps_titles() {
    let transport = Scripted::new(|req| {
        assert_eq!(param(req, "titles"), Some("knower|Gone|Ladilla Rusa"));
        assert!(param(req, "rvlimit").is_none());
        Ok(format!(
            r#"{{"batchcomplete":true,"query":{{
                "normalized":[{{"fromencoded":false,"from":"knower","to":"Knower"}}],
                "pages":[
                    {{"ns":0,"title":"Gone","missing":true}},
                    {{"pageid":7,"ns":0,"title":"Knower","revisions":[{}]}},
                    {{"pageid":8,"ns":0,"title":"Ladilla Rusa","revisions":[{}]}}
                ]}}}}"#,
            revision_json(700),
            revision_json(800)
        ))
    });
    let config = FetchConfig {
        mode: Mode::LatestRevision,
        ..fast_config()
    };
    let orch = Orchestrator::new(config, transport);
    let targets = [title("knower"), title("Gone"), title("Ladilla Rusa")];
    let report = orch.run(&targets).unwrap();

    assert_eq!(orch.transport().calls().len(), 1);
    assert_eq!(ids(&report.results[0].outcome), vec![700]);
    assert_eq!(
        report.results[0].outcome.history().unwrap().display_title(),
        "Knower"
    );
    assert_eq!(
        report.results[1].outcome.error(),
        Some(&FetchError::NotFound)
    );
    assert_eq!(ids(&report.results[2].outcome), vec![800]);
}

#[test]
fn latest_mode_feeds_aliases_and_repeats() {
    let transport = Scripted::new(|req| {
        assert_eq!(
            param(req, "titles"),
            Some("Ladilla Rusa|Ladilla_Rusa|Ladilla Rusa")
        );
        Ok(format!(
            r#"{{"batchcomplete":true,"query":{{
                "normalized":[{{"fromencoded":false,"from":"Ladilla_Rusa","to":"Ladilla Rusa"}}],
                "pages":[{{"pageid":8,"ns":0,"title":"Ladilla Rusa","revisions":[{}]}}]
            }}}}"#,
            revision_json(800)
        ))
    });
    let config = FetchConfig {
        mode: Mode::LatestRevision,
        ..fast_config()
    };
    let orch = Orchestrator::new(config, transport);
    let targets = [
        title("Ladilla Rusa"),
        title("Ladilla_Rusa"),
        title("Ladilla Rusa"),
    ];
    let report = orch.run(&targets).unwrap();

    assert_eq!(orch.transport().calls().len(), 1);
    assert!(report.all_complete());
    for result in &report.results {
        assert_eq!(ids(&result.outcome), vec![800]);
        assert_eq!(
            result.outcome.history().unwrap().display_title(),
            "Ladilla Rusa"
        );
    }
    assert_eq!(report.revisions(), 3);
}

fn extract_page(page_id: u64, title: &str, revid: u64, extract: &str) -> String {
    format!(
        r#"{{"pageid":{page_id},"ns":0,"title":"{title}","revisions":[{{"revid":{revid},"parentid":{},"user":"Editor","userid":1,"timestamp":"2024-05-01T10:00:00Z"}}],"extract":"{extract}"}}"#,
        revid - 1
    )
}

#[test]
fn latest_mode_returns_plain_intro_extracts() {
    let transport = Scripted::new(|req| {
        assert_eq!(param(req, "prop"), Some("revisions|extracts"));
        assert_eq!(param(req, "exintro"), Some("1"));
        assert_eq!(param(req, "explaintext"), Some("1"));
        assert_eq!(param(req, "titles"), Some("Ladilla_Rusa|Knower (duo)"));
        Ok(format!(
            r#"{{"batchcomplete":true,"query":{{
                "normalized":[{{"fromencoded":false,"from":"Ladilla_Rusa","to":"Ladilla Rusa"}}],
                "pages":[{},{}]}}}}"#,
            extract_page(8, "Ladilla Rusa", 800, "Ladilla Rusa is a Spanish band."),
            extract_page(7, "Knower (duo)", 700, "Knower is an American duo.")
        ))
    });
    let config = FetchConfig {
        mode: Mode::LatestRevision,
        latest_content: LatestContent::Extract,
        intro_only: true,
        ..fast_config()
    };
    let orch = Orchestrator::new(config, transport);
    let report = orch
        .run(&[title("Ladilla_Rusa"), title("Knower (duo)")])
        .unwrap();

    assert_eq!(orch.transport().calls().len(), 1);
    let texts: Vec<Option<&str>> = report
        .results
        .iter()
        .map(|r| r.outcome.history().unwrap().revisions[0].content.as_deref())
        .collect();
    assert_eq!(
        texts,
        vec![
            Some("Ladilla Rusa is a Spanish band."),
            Some("Knower is an American duo.")
        ]
    );
    assert_eq!(ids(&report.results[0].outcome), vec![800]);
}

#[test]
fn full_text_extracts_go_one_article_per_request() {
    let transport = Scripted::new(|req| {
        assert!(param(req, "exintro").is_none());
        let title = param(req, "titles").unwrap_or_default().to_string();
        assert!(!title.contains('|'), "batched full-text extracts: {title}");
        Ok(format!(
            r#"{{"batchcomplete":true,"query":{{"pages":[{}]}}}}"#,
            extract_page(1, &title, 100, "Full article text.")
        ))
    });
    let config = FetchConfig {
        mode: Mode::LatestRevision,
        latest_content: LatestContent::Extract,
        ..fast_config()
    };
    let orch = Orchestrator::new(config, transport);
    let report = orch.run(&[title("Knower"), title("Gone")]).unwrap();
    assert!(report.all_complete());
    assert_eq!(orch.transport().calls().len(), 2);
}

#[test]
fn outcomes_stream_as_articles_finish() {
    let seen = Mutex::new(Vec::new());
    let orch = Orchestrator::new(fast_config(), Scripted::new(five_revisions));
    let report = orch
        .run_with(&[title("A"), title("B"), title("C")], |r| {
            seen.lock().unwrap().push(r.index);
        })
        .unwrap();
    let mut seen = seen.into_inner().unwrap();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
    // Report order follows input order regardless of finish order
    let order: Vec<usize> = report.results.iter().map(|r| r.index).collect();
    assert_eq!(order, vec![0, 1, 2]);
}

#[test]
fn pipelines_wider_than_the_budget_never_overlap_more() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let transport = {
        let (in_flight, peak) = (Arc::clone(&in_flight), Arc::clone(&peak));
        Scripted::new(move |req| {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(3));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            five_revisions(req)
        })
    };
    let config = FetchConfig {
        concurrency: 2,
        ..fast_config()
    };
    let limiter = RateLimiter::from_config(&config);
    let cancel = CancelFlag::new();
    let ctx = PipelineContext {
        config: &config,
        transport: &transport,
        limiter: &limiter,
        cancel: &cancel,
    };

    // Eight pipelines on eight threads contend for two permits
    let targets: Vec<ArticleTarget> = (0..8).map(|i| title(&format!("T{i}"))).collect();
    let results: Vec<PipelineResult> = std::thread::scope(|s| {
        let handles: Vec<_> = targets
            .iter()
            .map(|t| {
                let ctx = &ctx;
                s.spawn(move || {
                    ctx.run(
                        Mode::FullHistory,
                        std::slice::from_ref(t),
                        &ProgressBar::hidden(),
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for result in &results {
        assert_eq!(ids(&result.outcomes[0]), vec![10, 11, 12, 13, 14]);
    }
    assert_eq!(transport.calls().len(), 24);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "{peak} requests in flight with a budget of 2");
    assert_eq!(limiter.in_flight(), 0);
}

#[test]
fn orchestrator_pool_completes_under_a_small_budget() {
    let config = FetchConfig {
        concurrency: 2,
        ..fast_config()
    };
    let orch = Orchestrator::new(config, Scripted::new(five_revisions));
    let targets: Vec<ArticleTarget> = (0..6).map(|i| title(&format!("T{i}"))).collect();
    let report = orch.run(&targets).unwrap();
    assert!(report.all_complete());
    assert_eq!(report.revisions(), 30);
    assert_eq!(orch.limiter().max_in_flight(), 2);
}

#[test]
#[ignore = "requires network access to en.wikipedia.org"]
fn live_latest_revision() {
    let config = FetchConfig {
        mode: Mode::LatestRevision,
        user_agent: "wikirev-tests/0.1 (integration test)".to_string(),
        ..Default::default()
    };
    let transport = HttpTransport::new(&config).unwrap();
    let orch = Orchestrator::new(config, transport);
    let report = orch
        .run(&[title("Rust (programming language)")])
        .unwrap();
    let history = report.results[0].outcome.history().unwrap();
    assert_eq!(history.revisions.len(), 1);
    assert!(history.revisions[0].content.is_some());
}
