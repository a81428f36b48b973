//! Demo data for local runs.

use chrono::NaiveTime;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use drip_core::DripResult;

use crate::store::EnrollmentStore;
use crate::types::{
    Branch, BranchTrigger, ContentBlock, Sequence, SequenceStep, StepContent, StepDelay, Template,
    DEFAULT_BRANCH_ID,
};

fn blocks(heading: &str, body: &str) -> Vec<ContentBlock> {
    vec![
        ContentBlock::new("heading", json!({ "text": heading })),
        ContentBlock::new("text", json!({ "text": body })),
    ]
}

/// Seeds a three-step "Welcome Series" with an engagement branch, an
/// action-click branch and a default fallback branch.
pub fn seed_welcome_series(store: &dyn EnrollmentStore) -> DripResult<Sequence> {
    let mut sequence = Sequence::new("Welcome Series");
    sequence.branch_delay_hours = 1;
    store.put_sequence(sequence.clone());

    let template = Template {
        id: Uuid::new_v4(),
        name: "welcome".to_string(),
        subject: "Welcome aboard, {{first_name}}".to_string(),
        blocks: vec![
            ContentBlock::new("heading", json!({ "text": "Hi {{first_name}}!" })),
            ContentBlock::new("text", json!({ "text": "Thanks for signing up." })),
            ContentBlock::new(
                "button",
                json!({ "label": "Get started", "url": "https://example.com/start" }),
            ),
        ],
    };
    store.put_template(template.clone());

    let welcome = SequenceStep::new(
        sequence.id,
        None,
        1,
        "",
        StepContent::Template {
            template_id: template.id,
        },
    );
    store.put_step(welcome.clone())?;
    store.put_step(
        SequenceStep::new(
            sequence.id,
            None,
            2,
            "A few tips, {{first_name}}",
            StepContent::Inline {
                blocks: blocks("Tips", "Here is how teams get the most out of the product."),
            },
        )
        .with_delay(StepDelay::days(2)),
    )?;
    store.put_step(
        SequenceStep::new(
            sequence.id,
            None,
            3,
            "Still there?",
            StepContent::Inline {
                blocks: blocks("Checking in", "Reply to this email if you need a hand."),
            },
        )
        .with_delay(StepDelay {
            days: 3,
            hours: 0,
            send_time: NaiveTime::from_hms_opt(9, 0, 0),
        }),
    )?;

    let mut vip = Branch::new(
        sequence.id,
        "vip",
        Some(welcome.id),
        BranchTrigger::ActionClick { button_id: None },
    );
    vip.name = "Booked a demo".to_string();
    store.put_branch(vip)?;

    let mut engaged = Branch::new(
        sequence.id,
        "engaged",
        Some(welcome.id),
        BranchTrigger::Opened { min_opens: 1 },
    );
    engaged.name = "Opened welcome".to_string();
    engaged.priority = 1;
    store.put_branch(engaged)?;

    let mut fallback = Branch::new(
        sequence.id,
        DEFAULT_BRANCH_ID,
        None,
        BranchTrigger::NoEngagement { after_steps: 1 },
    );
    fallback.name = "Default".to_string();
    store.put_branch(fallback)?;

    store.put_step(
        SequenceStep::new(
            sequence.id,
            Some("vip"),
            1,
            "Your demo is booked",
            StepContent::Inline {
                blocks: blocks("See you soon", "We will send a calendar invite shortly."),
            },
        ),
    )?;
    store.put_step(
        SequenceStep::new(
            sequence.id,
            Some("engaged"),
            1,
            "Ready for the next step?",
            StepContent::Inline {
                blocks: blocks("Go further", "Invite your team to collaborate."),
            },
        )
        .with_delay(StepDelay::days(1)),
    )?;
    store.put_step(
        SequenceStep::new(
            sequence.id,
            Some(DEFAULT_BRANCH_ID),
            1,
            "We saved your spot",
            StepContent::Inline {
                blocks: blocks("Come back any time", "Your workspace is waiting."),
            },
        )
        .with_delay(StepDelay::days(7)),
    )?;

    info!(sequence_id = %sequence.id, "Demo sequence seeded");
    Ok(sequence)
}
