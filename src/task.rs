use rand::Rng;

pub const SKIPTHOUGHT_NEXT: &str = "skipthought_next";
pub const SKIPTHOUGHT_PREVIOUS: &str = "skipthought_previous";

/// NLI gets one step out of this many.
pub const NLI_INTERVAL: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    Translation(usize),
    SkipthoughtForward { index: usize, partner: usize },
    SkipthoughtBackward { index: usize, partner: usize },
    Nli,
}

impl Task {
    /// Position of the task among the seq2seq corpora, `None` for NLI.
    pub fn index(&self) -> Option<usize> {
        match *self {
            Task::Translation(index)
            | Task::SkipthoughtForward { index, .. }
            | Task::SkipthoughtBackward { index, .. } => Some(index),
            Task::Nli => None,
        }
    }

    pub fn partner(&self) -> Option<usize> {
        match *self {
            Task::SkipthoughtForward { partner, .. } | Task::SkipthoughtBackward { partner, .. } => {
                Some(partner)
            }
            _ => None,
        }
    }
}

/// The seq2seq tasks of a run, in configuration order.
#[derive(Clone, Debug)]
pub struct TaskSet {
    names: Vec<String>,
    tasks: Vec<Task>,
    candidates: Vec<usize>,
}

impl TaskSet {
    /// Pairs `skipthought_next` with `skipthought_previous` when both exist;
    /// every other name is a translation task.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        let position = |wanted: &str| names.iter().position(|n| n == wanted);

        let pair = position(SKIPTHOUGHT_NEXT).zip(position(SKIPTHOUGHT_PREVIOUS));

        let tasks: Vec<Task> = (0..names.len())
            .map(|index| match pair {
                Some((forward, backward)) if index == forward => Task::SkipthoughtForward {
                    index,
                    partner: backward,
                },
                Some((forward, backward)) if index == backward => Task::SkipthoughtBackward {
                    index,
                    partner: forward,
                },
                _ => Task::Translation(index),
            })
            .collect();

        let candidates = tasks
            .iter()
            .filter(|task| !matches!(task, Task::SkipthoughtBackward { .. }))
            .filter_map(Task::index)
            .collect();

        Self {
            names,
            tasks,
            candidates,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Task> {
        self.tasks.get(index).copied()
    }

    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_paired(&self) -> bool {
        self.tasks
            .iter()
            .any(|task| matches!(task, Task::SkipthoughtForward { .. }))
    }

    /// Number of entries the sampler draws from; a pair counts once.
    pub fn rng_num_tasks(&self) -> usize {
        self.candidates.len()
    }

    /// Indices the sampler may draw. Backward halves are only reached through
    /// their forward partner.
    pub fn candidates(&self) -> &[usize] {
        &self.candidates
    }

    /// Tasks whose validation loss drives checkpoint selection. Anything
    /// named like a skip-thought task is left out.
    pub fn validation_tasks(&self) -> impl Iterator<Item = usize> + '_ {
        self.names
            .iter()
            .enumerate()
            .filter(|(_, name)| !name.contains("skipthought"))
            .map(|(index, _)| index)
    }
}

/// What one training step works on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Nli,
    Task(usize),
    PairedTask { forward: usize, backward: usize },
}

pub struct TaskScheduler<R> {
    tasks: TaskSet,
    rng: R,
}

impl<R: Rng> TaskScheduler<R> {
    pub fn new(tasks: TaskSet, rng: R) -> Self {
        Self { tasks, rng }
    }

    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    /// NLI whenever `nli_ctr` is a multiple of [`NLI_INTERVAL`], otherwise a
    /// uniformly drawn task (falling back to NLI when there are none).
    pub fn next_step(&mut self, nli_ctr: usize) -> Step {
        let candidates = self.tasks.candidates();

        if nli_ctr % NLI_INTERVAL == 0 || candidates.is_empty() {
            return Step::Nli;
        }

        let index = candidates[self.rng.gen_range(0..candidates.len())];

        match self.tasks.get(index) {
            Some(Task::SkipthoughtForward { index, partner }) => Step::PairedTask {
                forward: index,
                backward: partner,
            },
            _ => Step::Task(index),
        }
    }
}
