use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

/// One pending judging request: a cloned working copy tied to the
/// submission row it will update.
#[derive(Debug)]
pub struct Job {
    /// Clone URL of the question template repo; keys the script lookup
    pub question_clone_url: String,
    /// Freshly cloned user code, removed by the runner when done
    pub code_path: PathBuf,
    pub submission_id: i64,
}

/// FIFO of pending jobs. Producers are the enqueue API's clone tasks,
/// the single consumer is the worker loop, which polls rather than waits.
#[derive(Default)]
pub struct JobQueue {
    queue: Mutex<VecDeque<Job>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, job: Job) {
        self.queue.lock().unwrap().push_back(job);
    }

    pub fn try_pop(&self) -> Option<Job> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(submission_id: i64) -> Job {
        Job {
            question_clone_url: "questions/q7".to_string(),
            code_path: PathBuf::from("/tmp/code"),
            submission_id,
        }
    }

    #[test]
    fn pops_in_insertion_order() {
        let queue = JobQueue::new();
        queue.push(job(1));
        queue.push(job(2));
        queue.push(job(3));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop().unwrap().submission_id, 1);
        assert_eq!(queue.try_pop().unwrap().submission_id, 2);
        assert_eq!(queue.try_pop().unwrap().submission_id, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let queue = JobQueue::new();
        assert!(queue.try_pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn requeue_lands_at_the_tail() {
        let queue = JobQueue::new();
        queue.push(job(1));
        queue.push(job(2));

        // reserve miss: the popped job goes back at the tail
        let missed = queue.try_pop().unwrap();
        queue.push(missed);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().submission_id, 2);
        assert_eq!(queue.try_pop().unwrap().submission_id, 1);
    }
}
