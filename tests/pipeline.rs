//! Integration tests for the full mapping pipeline.
//!
//! Documents are built in-process; LLM escalation is exercised with
//! scripted `Disambiguator` fakes, so no network access is needed.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use futures::StreamExt;
use pdf_refmap::disambiguator::BoxFuture;
use pdf_refmap::{
    analyze, analyze_file, analyze_stream, analyze_with_cancel, cancel_pair, AnalysisOutput,
    AnalysisProgressCallback, BBox, BlockRole, DisambiguationRequest, DisambiguationResponse,
    Disambiguator, DisambiguatorError, EscalationError, EventStatus, FigureKind, LayoutDocument,
    LayoutElement, LayoutPage, MappingConfig, MappingStats, Stage, TextBlock,
};
use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn body(text: &str, page: usize, y: f32) -> TextBlock {
    TextBlock {
        id: None,
        text: text.to_string(),
        bbox: BBox::new(50.0, y, 500.0, 20.0),
        page_index: page,
        role: BlockRole::Body,
    }
}

fn caption(text: &str, page: usize, y: f32) -> TextBlock {
    TextBlock {
        role: BlockRole::Caption,
        bbox: BBox::new(60.0, y, 400.0, 20.0),
        ..body(text, page, y)
    }
}

fn element(kind: FigureKind, page: usize, y: f32, h: f32) -> LayoutElement {
    LayoutElement {
        id: String::new(),
        kind,
        bbox: BBox::new(50.0, y, 450.0, h),
        page_index: page,
        raw_text: String::new(),
        explicit_id: None,
    }
}

fn page(index: usize, blocks: Vec<TextBlock>, elements: Vec<LayoutElement>) -> LayoutPage {
    LayoutPage {
        index,
        page_size: [612.0, 792.0],
        blocks,
        elements,
    }
}

fn document(pages: Vec<LayoutPage>) -> LayoutDocument {
    LayoutDocument {
        filename: Some("paper.pdf".into()),
        file_size: None,
        pages,
    }
}

/// Page 0 mentions an equation that does not exist; page 0 has equation (3).
fn equation_document() -> LayoutDocument {
    let mut eq = element(FigureKind::Equation, 0, 200.0, 40.0);
    eq.raw_text = "E = mc^2    (3)".into();
    document(vec![page(
        0,
        vec![body("From Eq. (5) we obtain the bound.", 0, 100.0)],
        vec![eq],
    )])
}

/// A figure nobody captioned, referenced as "Fig. 1".
fn uncaptioned_figure_document() -> LayoutDocument {
    document(vec![page(
        0,
        vec![body("The pipeline in Fig. 1 has three stages.", 0, 50.0)],
        vec![element(FigureKind::Figure, 0, 100.0, 200.0)],
    )])
}

async fn run(doc: LayoutDocument, config: &MappingConfig) -> AnalysisOutput {
    analyze(doc, config).await.expect("analysis should succeed")
}

// ── Scripted disambiguators ──────────────────────────────────────────────────

/// Never answers within any reasonable timeout.
struct Sleeper {
    calls: Mutex<usize>,
}

impl Disambiguator for Sleeper {
    fn name(&self) -> &str {
        "sleeper"
    }

    fn disambiguate<'a>(
        &'a self,
        _request: &'a DisambiguationRequest,
    ) -> BoxFuture<'a, Result<DisambiguationResponse, DisambiguatorError>> {
        *self.calls.lock().unwrap() += 1;
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(DisambiguationResponse { chosen_id: None })
        })
    }
}

/// Always picks the first candidate, remembering what it was asked.
struct PickFirst {
    seen: Mutex<Vec<DisambiguationRequest>>,
}

impl Disambiguator for PickFirst {
    fn name(&self) -> &str {
        "pick-first"
    }

    fn disambiguate<'a>(
        &'a self,
        request: &'a DisambiguationRequest,
    ) -> BoxFuture<'a, Result<DisambiguationResponse, DisambiguatorError>> {
        self.seen.lock().unwrap().push(request.clone());
        let chosen_id = request.candidate_list.first().map(|c| c.id.clone());
        Box::pin(async move { Ok(DisambiguationResponse { chosen_id }) })
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn captioned_figure_is_matched_by_id() {
    let doc = document(vec![
        page(0, vec![body("Introduction.", 0, 50.0)], vec![]),
        page(
            1,
            vec![
                body("As Fig. 1 illustrates, the encoder is shallow.", 1, 50.0),
                caption("Figure 1: Overview", 1, 310.0),
            ],
            vec![element(FigureKind::Figure, 1, 100.0, 200.0)],
        ),
    ]);
    let out = run(doc, &MappingConfig::default()).await;

    let refs: Vec<_> = out.references().collect();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].text, "Fig. 1");
    assert_eq!(refs[0].figure_id.as_deref(), Some("1"));
    assert!(!refs[0].not_matched);
    assert!(out.pages[0].references.is_empty());

    let fig = out.figure(FigureKind::Figure, "1").expect("figure 1");
    assert_eq!(fig.page_idx, 1);
    assert_eq!(fig.text, "Figure 1: Overview");
    assert!(!fig.synthetic);
    assert_eq!(out.stats().matched_by_rules, 1);
}

#[tokio::test]
async fn untyped_caption_names_the_figure_without_citing_it() {
    let mut untyped = body("Figure 1: Overview of the system", 0, 310.0);
    untyped.role = BlockRole::Unknown;
    let doc = document(vec![page(
        0,
        vec![untyped],
        vec![element(FigureKind::Figure, 0, 100.0, 200.0)],
    )]);
    let out = run(doc, &MappingConfig::default()).await;

    assert_eq!(out.references().count(), 0);
    assert_eq!(out.stats().total_mentions, 0);
    let fig = out.figure(FigureKind::Figure, "1").expect("figure 1");
    assert_eq!(fig.text, "Figure 1: Overview of the system");
}

#[tokio::test]
async fn reference_to_missing_table_stays_unmatched() {
    let doc = document(vec![page(
        0,
        vec![body("Table 3 lists the hyper-parameters.", 0, 50.0)],
        vec![element(FigureKind::Figure, 0, 100.0, 200.0)],
    )]);
    let out = run(doc, &MappingConfig::default()).await;

    let r = out.references().next().expect("one reference");
    assert_eq!(r.kind, FigureKind::Table);
    assert!(r.not_matched);
    assert!(r.figure_id.is_none());
    assert_eq!(out.stats().escalated, 0);
    assert_eq!(out.stats().not_matched, 1);
}

#[tokio::test]
async fn parts_sharing_a_caption_number_become_one_figure() {
    let doc = document(vec![page(
        0,
        vec![
            body("Fig. 2 compares both settings.", 0, 40.0),
            caption("Figure 2: Left setting", 0, 260.0),
            caption("Figure 2: Right setting", 0, 610.0),
        ],
        vec![
            element(FigureKind::Figure, 0, 100.0, 150.0),
            element(FigureKind::Figure, 0, 450.0, 150.0),
        ],
    )]);
    let out = run(doc, &MappingConfig::default()).await;

    assert_eq!(out.figures.len(), 1);
    let fig = &out.figures[0];
    assert_eq!(fig.figure_id, "2");
    assert_eq!(fig.elements, vec!["p0-e0", "p0-e1"]);
    assert_eq!(fig.bbox.y, 100.0);
    assert!(fig.bbox.bottom() >= 630.0);
    assert!(fig.text.contains("Left setting") && fig.text.contains("Right setting"));
    assert_eq!(
        out.references().next().unwrap().figure_id.as_deref(),
        Some("2")
    );
}

#[tokio::test]
async fn disambiguator_timeouts_degrade_to_unmatched() {
    let sleeper = Arc::new(Sleeper {
        calls: Mutex::new(0),
    });
    let config = MappingConfig::builder()
        .disambiguator(sleeper.clone())
        .timeout_ms(20)
        .retry_attempts(3)
        .retry_delay_ms(1)
        .build()
        .unwrap();

    let out = run(equation_document(), &config).await;

    let r = out.references().next().expect("one reference");
    assert_eq!(r.text, "Eq. (5)");
    assert!(r.not_matched);
    assert_eq!(*sleeper.calls.lock().unwrap(), 3);
    assert_eq!(out.stats().escalated, 1);
    assert_eq!(out.stats().escalation_failures, 1);
    assert_eq!(
        out.report.escalation_failures,
        vec![EscalationError::Timeout {
            mention: 0,
            attempts: 3,
            timeout_ms: 20,
        }]
    );
    assert!(out.figure(FigureKind::Equation, "3").is_some());
}

#[tokio::test]
async fn disambiguator_settles_what_rules_cannot() {
    let picker = Arc::new(PickFirst {
        seen: Mutex::new(Vec::new()),
    });
    let config = MappingConfig::builder()
        .disambiguator(picker.clone())
        .build()
        .unwrap();

    let out = run(uncaptioned_figure_document(), &config).await;

    let r = out.references().next().unwrap();
    assert_eq!(r.figure_id.as_deref(), Some("figure-seq-1"));
    assert!(!r.not_matched);
    assert_eq!(out.stats().matched_by_disambiguator, 1);
    assert_eq!(out.stats().matched_by_rules, 0);
    assert!(out.figures[0].synthetic);

    let seen = picker.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].mention_text, "Fig. 1");
    assert!(seen[0].context_window.contains("three stages"));
    assert_eq!(seen[0].candidate_list[0].kind, FigureKind::Figure);
}

#[tokio::test]
async fn without_a_disambiguator_synthetic_figures_are_not_guessed() {
    let out = run(uncaptioned_figure_document(), &MappingConfig::default()).await;
    let r = out.references().next().unwrap();
    assert!(r.not_matched);
    assert_eq!(out.stats().synthetic_figures, 1);
}

// ── Properties ───────────────────────────────────────────────────────────────

fn busy_document() -> LayoutDocument {
    document(vec![
        page(
            0,
            vec![
                body("Fig. 1 and Table 1 summarise the results; see also Figs. 2-3.", 0, 40.0),
                caption("Figure 1: Results", 0, 310.0),
                caption("Table 1: Numbers", 0, 580.0),
            ],
            vec![
                element(FigureKind::Figure, 0, 100.0, 200.0),
                element(FigureKind::Table, 0, 400.0, 170.0),
            ],
        ),
        page(
            1,
            vec![
                body("We return to Fig. 1 and Figure 2 here.", 1, 40.0),
                caption("Figure 2: Ablation", 1, 310.0),
                caption("Table 4: Unrelated", 1, 580.0),
            ],
            vec![
                element(FigureKind::Figure, 1, 100.0, 200.0),
                element(FigureKind::Figure, 1, 400.0, 170.0),
            ],
        ),
    ])
}

#[tokio::test]
async fn rerunning_is_idempotent() {
    let config = MappingConfig::default();
    let mut a = run(busy_document(), &config).await;
    let mut b = run(busy_document(), &config).await;
    a.metadata.processing_time = 0.0;
    b.metadata.processing_time = 0.0;
    assert_eq!(a, b);
}

#[tokio::test]
async fn repeated_mentions_resolve_to_the_same_figure() {
    let out = run(busy_document(), &MappingConfig::default()).await;
    let fig1: Vec<_> = out
        .references()
        .filter(|r| r.kind == FigureKind::Figure && r.text == "Fig. 1")
        .collect();
    assert_eq!(fig1.len(), 2);
    assert!(fig1.iter().all(|r| r.figure_id.as_deref() == Some("1")));
}

#[tokio::test]
async fn matched_references_point_at_same_kind_figures() {
    let out = run(busy_document(), &MappingConfig::default()).await;
    for r in out.references() {
        match &r.figure_id {
            Some(id) => {
                assert!(!r.not_matched);
                assert!(
                    out.figure(r.kind, id).is_some(),
                    "{} -> {} {id} does not exist",
                    r.text,
                    r.kind
                );
            }
            None => assert!(r.not_matched),
        }
    }
    // "Figs. 2-3": 3 has no figure.
    let figs_range: Vec<_> = out.references().filter(|r| r.text == "Figs. 2-3").collect();
    assert_eq!(figs_range.len(), 2);
    assert_eq!(figs_range[0].figure_id.as_deref(), Some("2"));
    assert!(figs_range[1].not_matched);
}

#[tokio::test]
async fn named_figure_ids_are_unique_per_kind() {
    let out = run(busy_document(), &MappingConfig::default()).await;
    let mut seen = HashSet::new();
    for f in out.figures.iter().filter(|f| !f.synthetic) {
        assert!(
            seen.insert((f.kind, f.figure_id.clone())),
            "duplicate {} {}",
            f.kind,
            f.figure_id
        );
    }
    // The caption "Table 4" sits under a figure element and names nothing.
    assert!(out.figure(FigureKind::Table, "4").is_none());
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancelling_mid_escalation_returns_a_complete_document() {
    let config = MappingConfig::builder()
        .disambiguator(Arc::new(Sleeper {
            calls: Mutex::new(0),
        }))
        .timeout_ms(60_000)
        .build()
        .unwrap();
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let out = tokio::time::timeout(
        Duration::from_secs(3),
        analyze_with_cancel(equation_document(), &config, signal),
    )
    .await
    .expect("cancellation must cut the 5 s call short")
    .unwrap();

    assert!(out.stats().cancelled);
    assert!(out.references().all(|r| r.not_matched));
    assert_eq!(
        out.report.escalation_failures,
        vec![EscalationError::Cancelled { mention: 0 }]
    );
}

#[tokio::test]
async fn cancelled_before_start_skips_escalation() {
    let picker = Arc::new(PickFirst {
        seen: Mutex::new(Vec::new()),
    });
    let config = MappingConfig::builder()
        .disambiguator(picker.clone())
        .build()
        .unwrap();
    let (handle, signal) = cancel_pair();
    handle.cancel();

    let out = analyze_with_cancel(uncaptioned_figure_document(), &config, signal)
        .await
        .unwrap();
    assert!(out.stats().cancelled);
    assert_eq!(out.stats().escalated, 0);
    assert!(picker.seen.lock().unwrap().is_empty());
}

// ── Progress & streaming ─────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    stages: Mutex<Vec<(Stage, u8)>>,
    started: Mutex<Option<usize>>,
    finished: Mutex<Option<MappingStats>>,
}

impl AnalysisProgressCallback for Recorder {
    fn on_analysis_start(&self, total_pages: usize) {
        *self.started.lock().unwrap() = Some(total_pages);
    }

    fn on_stage_complete(&self, stage: Stage, progress: u8) {
        self.stages.lock().unwrap().push((stage, progress));
    }

    fn on_analysis_complete(&self, stats: &MappingStats) {
        *self.finished.lock().unwrap() = Some(stats.clone());
    }
}

#[tokio::test]
async fn progress_callback_sees_every_stage() {
    let recorder = Arc::new(Recorder::default());
    let config = MappingConfig::builder()
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let out = run(busy_document(), &config).await;

    assert_eq!(*recorder.started.lock().unwrap(), Some(2));
    let progress: Vec<u8> = recorder.stages.lock().unwrap().iter().map(|s| s.1).collect();
    assert_eq!(progress, vec![10, 40, 60, 80, 95, 100]);
    assert_eq!(recorder.finished.lock().unwrap().as_ref(), Some(out.stats()));
}

#[tokio::test]
async fn stream_ends_with_the_document() {
    let recorder = Arc::new(Recorder::default());
    let config = MappingConfig::builder()
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let events: Vec<_> = analyze_stream(busy_document(), &config).collect().await;

    assert_eq!(events.first().unwrap().status, EventStatus::Started);
    let last = events.last().unwrap();
    assert_eq!(last.status, EventStatus::Completed);
    let data = last.data.as_ref().expect("completed carries the document");
    assert_eq!(data.metadata.total_pages, 2);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let progress: Vec<u8> = events
        .iter()
        .filter(|e| e.status == EventStatus::Progress)
        .filter_map(|e| e.progress)
        .collect();
    assert_eq!(progress, vec![10, 40, 60, 80, 95, 100]);
    // The caller's own callback still fires.
    assert_eq!(recorder.stages.lock().unwrap().len(), 6);
    assert!(last.to_sse_frame().starts_with("data: {\"status\":\"completed\""));
}

// ── File input ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn analyzes_collaborator_json_from_disk() {
    let json = r#"{
        "pages": [{
            "index": 0,
            "page_size": [612, 792],
            "blocks": [
                {"text": "See Tab. 2 for timings.", "bbox": [50, 40, 550, 60], "block_type": "Text"},
                {"text": "Table 2: Timings", "bbox": [60, 310, 460, 330], "block_type": "Caption"}
            ],
            "figures": [
                {"type": "Table", "bbox": [50, 100, 500, 300]}
            ]
        }]
    }"#;
    let mut f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    f.write_all(json.as_bytes()).unwrap();

    let out = analyze_file(f.path().to_str().unwrap(), &MappingConfig::default())
        .await
        .unwrap();
    assert!(out.metadata.filename.ends_with(".json"));
    assert_eq!(out.metadata.file_size, json.len() as u64);
    let r = out.references().next().unwrap();
    assert_eq!(r.kind, FigureKind::Table);
    assert_eq!(r.figure_id.as_deref(), Some("2"));
}
