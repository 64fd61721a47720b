use boardsync::{BoardId, Color, Document, LocalEdit, Path, Point, Snapshot, UpdateOp};
use proptest::prelude::*;
use proptest::test_runner::Config;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};

/// The plainest possible board: a version counter and a list
#[derive(Clone, Debug)]
struct ModelBoard {
    version: u64,
    paths: Vec<Path>,
}

impl ModelBoard {
    fn apply(&mut self, edit: &LocalEdit) {
        match edit {
            LocalEdit::Append(path) => self.paths.push(path.clone()),
            LocalEdit::Undo => {
                self.paths.pop();
            }
            LocalEdit::Clear => self.paths.clear(),
        }
        self.version += 1;
    }
}

/// The operations on an owner and its one subscriber
#[derive(Clone, Debug)]
pub enum Ops {
    /// Owner edit made on top of `version - lag`; the broadcast may be lost
    Edit {
        edit: LocalEdit,
        lag: u64,
        delivered: bool,
    },
    /// Subscriber receives the latest broadcast again, or late
    Rebroadcast,
}

fn path_strategy() -> impl Strategy<Value = Path> {
    let color = prop_oneof![
        Just(Color::Black),
        Just(Color::Red),
        any::<(u8, u8, u8)>().prop_map(|(r, g, b)| Color::Rgb(r, g, b)),
    ];
    let points = prop::collection::vec((-500i32..500, -500i32..500), 1..5)
        .prop_map(|ps| ps.into_iter().map(|(x, y)| Point::new(x, y)).collect::<Vec<_>>());
    (color, points).prop_map(|(color, points)| Path::new(color, points).unwrap())
}

fn edit_strategy() -> impl Strategy<Value = LocalEdit> {
    prop_oneof![
        4 => path_strategy().prop_map(LocalEdit::Append),
        1 => Just(LocalEdit::Undo),
        1 => Just(LocalEdit::Clear),
    ]
}

prop_state_machine! {
    #![proptest_config(Config {
        verbose: 1,
        .. Config::default()
    })]

    #[test]
    fn board_replication_stateful(
        sequential
        1..60
        =>
        ReplicatedBoard
    );
}

struct BoardModel;

impl ReferenceStateMachine for BoardModel {
    type State = ModelBoard;
    type Transition = Ops;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(ModelBoard {
            version: 0,
            paths: Vec::new(),
        })
        .boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            6 => (edit_strategy(), prop_oneof![3 => Just(0u64), 1 => 1u64..3], any::<bool>())
                .prop_map(|(edit, lag, delivered)| Ops::Edit { edit, lag, delivered }),
            1 => Just(Ops::Rebroadcast),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        if let Ops::Edit { edit, lag, .. } = transition {
            // Stale unless made on top of the current version
            if state.version.saturating_sub(*lag) == state.version {
                state.apply(edit);
            }
        }
        state
    }
}

/// An owner document and a replica that follows its broadcasts
struct ReplicatedBoard {
    owner: Document,
    replica: Document,
    last_broadcast: Option<(UpdateOp, Snapshot)>,
}

impl ReplicatedBoard {
    /// What a subscriber does with one broadcast
    fn deliver(&mut self, op: UpdateOp, broadcast: &Snapshot) {
        // The broadcast goes over the wire as text
        let broadcast = Snapshot::decode(&broadcast.encode()).unwrap();
        let applied = self.replica.apply_update(op, &broadcast).unwrap();
        if !applied && !self.replica.has_seen(&broadcast) {
            // Missed something: catch up from a fresh snapshot
            let fresh = Snapshot::decode(&self.owner.snapshot().encode()).unwrap();
            self.replica.bootstrap(fresh).unwrap();
        }
    }
}

impl StateMachineTest for ReplicatedBoard {
    type SystemUnderTest = Self;
    type Reference = BoardModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        let id: BoardId = "127.0.0.1:4000:board1".parse().unwrap();
        let owner = Document::new(id);
        let replica = Document::from_snapshot(owner.snapshot());
        Self {
            owner,
            replica,
            last_broadcast: None,
        }
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        match transition {
            Ops::Edit {
                edit,
                lag,
                delivered,
            } => {
                let before = state.owner.snapshot();
                let base = state.owner.version().saturating_sub(lag);
                let op = edit.op();
                let accepted = state.owner.apply_edit(edit, base);
                assert_eq!(accepted, base == before.version);
                if !accepted {
                    assert_eq!(state.owner.snapshot(), before);
                } else {
                    let broadcast = state.owner.snapshot();
                    if delivered {
                        state.deliver(op, &broadcast);
                    }
                    state.last_broadcast = Some((op, broadcast));
                }
            }
            Ops::Rebroadcast => {
                if let Some((op, broadcast)) = state.last_broadcast.clone() {
                    state.deliver(op, &broadcast);
                }
            }
        }

        assert_eq!(state.owner.version(), ref_state.version);
        assert_eq!(state.owner.history(), ref_state.paths.as_slice());
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        assert!(state.replica.version() <= state.owner.version());
        if state.replica.version() == state.owner.version() {
            assert_eq!(state.replica.history(), state.owner.history());
        }
    }
}
