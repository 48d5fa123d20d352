use crate::tasks::Task;

/// Dispatch messages come in two families, keyed by dispatch kind: task
/// automation (todo/doing/pending) renders a `Task #<id>` header, while
/// escalations and notifications render a `Task ID: <id>` listing. The two
/// layouts are intentionally separate templates, not one formatter.

pub fn todo_nudge(task: &Task) -> String {
    let mut msg = format!(
        "You have an open task.\n\nTask #{}: {}\n",
        task.task_id, task.title
    );
    if !task.description.trim().is_empty() {
        msg.push_str(&format!("\n{}\n", task.description.trim()));
    }
    msg.push_str("\nPick it up and move it to doing, or hand it back with a note.");
    msg
}

pub fn doing_reminder(task: &Task, stale_minutes: u64) -> String {
    format!(
        "Task #{}: {} has been in doing for over {} minutes without an update.\n\
         Post a worklog entry with where things stand, or move it to pending with a reason.",
        task.task_id, task.title, stale_minutes
    )
}

pub fn pending_reminder(task: &Task) -> String {
    let reason = task
        .status_reason
        .as_deref()
        .unwrap_or("no reason recorded");
    format!(
        "Task #{}: {} is parked in pending ({reason}).\n\
         Follow up on what it is waiting for and resume it if you can.",
        task.task_id, task.title
    )
}

pub fn blocked_escalation(task: &Task) -> String {
    let mut msg = format!(
        "A task assigned to your reportee {} is blocked and needs your attention.\n\n\
         Task ID: {}\nTitle: {}\nBlockers:\n",
        task.assigned_to, task.task_id, task.title
    );
    for blocker in &task.blockers {
        msg.push_str(&format!("- {}\n", blocker.content));
    }
    msg.push_str("\nUnblock it, reassign it, or escalate further.");
    msg
}

pub fn inactive_notification(inactive: &[(String, u64)], threshold_minutes: u64) -> String {
    let mut msg = format!(
        "The following agents reporting to you have been inactive for over {threshold_minutes} minutes:\n"
    );
    for (agent_id, idle_minutes) in inactive {
        msg.push_str(&format!("- {agent_id} (idle {idle_minutes} min)\n"));
    }
    msg.push_str("\nCheck in with them and make sure they have actionable work.");
    msg
}

pub fn topdown_guidance(open_tasks: usize, threshold: usize) -> String {
    format!(
        "Your open task count is down to {open_tasks} (threshold {threshold}).\n\
         Review the organization's goals, break the next milestone into tasks,\n\
         and delegate them to your reportees."
    )
}
