//! Selected-text mode against a curated set of passages: answers drawn from
//! the passage are accepted, answers that wander outside it are refused.

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use book_rag::generation::CompletionProvider;
use book_rag::orchestrator::SelectionRequest;
use book_rag_core::models::RefusalReason;
use book_rag_core::prompt::SELECTION_REFUSAL;

use common::{fixture, test_config, KeywordEmbedder, ScriptedAnswers};

const DOMAIN_VOCAB: &[&str] = &[
    "lidar",
    "odometry",
    "urdf",
    "gazebo",
    "ros 2",
    "isaac",
    "nav2",
    "moveit",
    "quaternion",
    "kalman",
    "servo",
    "torque",
    "battery",
    "actuator",
    "encoder",
    "point cloud",
    "humanoid",
    "zmp",
    "inverse kinematics",
    "rviz",
    "speed",
    "weight",
    "price",
    "modularity",
    "redundancy",
];

struct Case {
    selection: &'static str,
    question: &'static str,
    reply: &'static str,
    in_selection: bool,
}

const fn case(
    selection: &'static str,
    question: &'static str,
    reply: &'static str,
    in_selection: bool,
) -> Case {
    Case {
        selection,
        question,
        reply,
        in_selection,
    }
}

const CASES: &[Case] = &[
    // Answers restating the passage.
    case(
        "A lidar sweeps the room and returns a point cloud of distances.",
        "What does the sensor return?",
        "The lidar returns a point cloud.",
        true,
    ),
    case(
        "Wheel odometry integrates encoder ticks into a pose estimate.",
        "How is the pose estimated?",
        "Odometry integrates encoder ticks.",
        true,
    ),
    case(
        "The robot's links and joints are declared in a URDF file.",
        "Where are the joints declared?",
        "They are declared in the URDF.",
        true,
    ),
    case(
        "Gazebo loads the world and steps the physics engine.",
        "Which tool steps the physics?",
        "Gazebo steps the physics engine.",
        true,
    ),
    case(
        "Nodes in ROS 2 exchange messages over topics.",
        "How do nodes communicate?",
        "In ROS 2 nodes use topics.",
        true,
    ),
    case(
        "Isaac Sim generates synthetic training images.",
        "What produces the synthetic images?",
        "Isaac Sim produces them.",
        true,
    ),
    case(
        "Nav2 plans a path and follows it with a controller.",
        "What plans the path?",
        "Nav2 plans the path.",
        true,
    ),
    case(
        "MoveIt computes collision-free arm trajectories.",
        "What computes arm trajectories?",
        "MoveIt does.",
        true,
    ),
    case(
        "Orientation is stored as a quaternion to avoid gimbal lock.",
        "How is orientation stored?",
        "As a quaternion.",
        true,
    ),
    case(
        "A Kalman filter fuses the IMU with wheel odometry.",
        "What fuses the IMU data?",
        "A Kalman filter fuses it with odometry.",
        true,
    ),
    case(
        "Each servo reports the torque it applies.",
        "What does each joint motor report?",
        "Every servo reports its torque.",
        true,
    ),
    case(
        "The battery powers every actuator in the leg.",
        "What powers the leg?",
        "The battery powers each actuator.",
        true,
    ),
    case(
        "The humanoid balances by keeping the ZMP inside the support polygon.",
        "How does it stay balanced?",
        "The humanoid keeps the ZMP inside the polygon.",
        true,
    ),
    case(
        "Inverse kinematics maps a target hand pose to joint angles.",
        "How are joint angles found?",
        "Through inverse kinematics.",
        true,
    ),
    case(
        "RViz displays the live point cloud.",
        "Where can I see the scan?",
        "RViz shows the point cloud.",
        true,
    ),
    case(
        "The rover's top speed is 2 m/s and its weight is 12 kg.",
        "How fast and heavy is the rover?",
        "Its speed is 2 m/s and its weight 12 kg.",
        true,
    ),
    case(
        "The kit's price includes a spare battery.",
        "What comes with the kit?",
        "The price includes a spare battery.",
        true,
    ),
    case(
        "Design principles include modularity and redundancy.",
        "What are the design principles?",
        "Modularity and redundancy.",
        true,
    ),
    case(
        "Each actuator has an encoder on its output shaft.",
        "Where is the position sensor?",
        "The encoder sits on each actuator.",
        true,
    ),
    case(
        "The lidar driver publishes scans to ROS 2 topics.",
        "Where do scans go?",
        "The lidar publishes to ROS 2 topics.",
        true,
    ),
    // Answers that use outside knowledge.
    case(
        "Design principles include modularity and redundancy.",
        "What is the top speed of this robot?",
        "The top speed is about 1.5 m/s.",
        false,
    ),
    case(
        "A lidar sweeps the room and returns a point cloud of distances.",
        "How much does it cost?",
        "The price is around 400 dollars.",
        false,
    ),
    case(
        "Gazebo loads the world and steps the physics engine.",
        "Can it simulate Isaac scenes?",
        "Isaac Sim handles photorealistic scenes instead.",
        false,
    ),
    case(
        "The robot's links and joints are declared in a URDF file.",
        "How heavy is the robot?",
        "Its weight is about 30 kg.",
        false,
    ),
    case(
        "The humanoid balances by keeping the ZMP inside the support polygon.",
        "What motors does it use?",
        "It uses servo motors with high torque.",
        false,
    ),
    case(
        "Wheel odometry integrates encoder ticks into a pose estimate.",
        "How is odometry corrected?",
        "Odometry drift is corrected by a Kalman filter.",
        false,
    ),
    case(
        "Nav2 plans a path and follows it with a controller.",
        "How is the map visualized?",
        "Nav2 maps are shown in RViz.",
        false,
    ),
    case(
        "MoveIt computes collision-free arm trajectories.",
        "How are the joint angles solved?",
        "MoveIt uses inverse kinematics plugins.",
        false,
    ),
    case(
        "Orientation is stored as a quaternion to avoid gimbal lock.",
        "Which filter estimates orientation?",
        SELECTION_REFUSAL,
        false,
    ),
    case(
        "The battery powers every actuator in the leg.",
        "How long does the battery last?",
        SELECTION_REFUSAL,
        false,
    ),
];

#[tokio::test]
async fn test_curated_selection_set_is_classified_correctly() {
    let tmp = TempDir::new().unwrap();
    let pairs: Vec<(&str, &str)> = CASES.iter().map(|c| (c.question, c.reply)).collect();
    let provider = Arc::new(ScriptedAnswers::new(&pairs));
    let fx = fixture(
        test_config(&tmp, ""),
        Arc::new(KeywordEmbedder::new(DOMAIN_VOCAB)),
        vec![provider.clone() as Arc<dyn CompletionProvider>],
    )
    .await;

    let mut wrong = Vec::new();
    for (i, c) in CASES.iter().enumerate() {
        let resp = fx
            .orchestrator
            .query_selected_text(
                SelectionRequest {
                    query: c.question.to_string(),
                    selected_text: c.selection.to_string(),
                    session_id: Some(format!("reader-{}", i)),
                    user_id: None,
                },
                "203.0.113.1",
            )
            .await
            .unwrap();

        if resp.in_selected_text != c.in_selection {
            wrong.push(format!("#{} {:?}: got {}", i, c.question, resp.in_selected_text));
            continue;
        }
        if c.in_selection {
            assert_eq!(resp.answer, c.reply);
            assert_eq!(resp.refusal_reason, None);
        } else {
            assert_eq!(resp.answer, SELECTION_REFUSAL);
            let expected = if c.reply == SELECTION_REFUSAL {
                RefusalReason::ModelDeclined
            } else {
                RefusalReason::NotInSelection
            };
            assert_eq!(resp.refusal_reason, Some(expected), "case #{}", i);
        }
        assert!(!resp.selection_truncated);
    }

    assert!(wrong.is_empty(), "misclassified: {:#?}", wrong);
    assert_eq!(provider.calls(), CASES.len());
}

#[tokio::test]
async fn test_refused_selection_turn_is_recorded() {
    let tmp = TempDir::new().unwrap();
    let c = &CASES[20];
    let provider = Arc::new(ScriptedAnswers::new(&[(c.question, c.reply)]));
    let fx = fixture(
        test_config(&tmp, ""),
        Arc::new(KeywordEmbedder::new(DOMAIN_VOCAB)),
        vec![provider as Arc<dyn CompletionProvider>],
    )
    .await;

    let resp = fx
        .orchestrator
        .query_selected_text(
            SelectionRequest {
                query: c.question.to_string(),
                selected_text: c.selection.to_string(),
                session_id: Some("design-review".to_string()),
                user_id: Some("u-17".to_string()),
            },
            "203.0.113.1",
        )
        .await
        .unwrap();
    assert!(!resp.in_selected_text);

    let page = fx.orchestrator.get_history("design-review", None, None).await.unwrap();
    assert_eq!(page.message_count, 1);
    let m = &page.messages[0];
    assert!(!m.grounded);
    assert_eq!(m.assistant_text, SELECTION_REFUSAL);
    assert_eq!(m.selected_text.as_deref(), Some(c.selection));
    assert!(m.source_refs.is_empty());
}

#[tokio::test]
async fn test_oversized_selection_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedAnswers::new(&[]));
    let fx = fixture(
        test_config(&tmp, "\n[selection]\nmax_chars = 100\n"),
        Arc::new(KeywordEmbedder::new(DOMAIN_VOCAB)),
        vec![provider.clone() as Arc<dyn CompletionProvider>],
    )
    .await;

    let err = fx
        .orchestrator
        .query_selected_text(
            SelectionRequest {
                query: "Summarize this".to_string(),
                selected_text: "lidar ".repeat(50),
                ..SelectionRequest::default()
            },
            "203.0.113.1",
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_long_selection_is_truncated_to_the_token_budget() {
    let tmp = TempDir::new().unwrap();
    let question = "What does the passage describe?";
    let provider = Arc::new(ScriptedAnswers::new(&[(question, "It describes the lidar.")]));
    let fx = fixture(
        test_config(&tmp, "\n[selection]\nmax_tokens = 10\n"),
        Arc::new(KeywordEmbedder::new(DOMAIN_VOCAB)),
        vec![provider as Arc<dyn CompletionProvider>],
    )
    .await;

    // The lidar mention survives truncation; the battery one does not.
    let selection = format!("The lidar is mounted on top. {}The battery.", "x ".repeat(200));
    let resp = fx
        .orchestrator
        .query_selected_text(
            SelectionRequest {
                query: question.to_string(),
                selected_text: selection,
                ..SelectionRequest::default()
            },
            "203.0.113.1",
        )
        .await
        .unwrap();
    assert!(resp.selection_truncated);
    assert!(resp.in_selected_text);
}
