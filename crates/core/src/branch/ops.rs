use std::collections::{BTreeSet, HashSet};

use snafu::OptionExt;

use crate::chat::{BranchNode, Chat};
use crate::error::{
    BranchNotFoundSnafu, BranchResult, CorruptBranchTreeSnafu, MessageNotFoundSnafu,
    RootBranchImmutableSnafu,
};
use crate::ids::{BranchId, MessageId};
use crate::message::Message;

/// Attaches `draft` as a new sibling version of `source_message_id` and returns its branch.
///
/// Siblings always hang off one shared divergence point: branching from a message that is
/// itself a branched version reuses that version's parent instead of nesting deeper.
/// The caller decides whether to switch the active path to the returned branch.
pub fn create_branch_from_message(
    chat: &mut Chat,
    source_message_id: &MessageId,
    mut draft: Message,
) -> BranchResult<BranchId> {
    let source = chat.message(source_message_id).context(MessageNotFoundSnafu {
        stage: "create-branch-load-source",
        chat_id: chat.id.clone(),
        message_id: source_message_id.clone(),
    })?;
    let parent_message_id = source
        .parent_id
        .clone()
        .unwrap_or_else(|| source_message_id.clone());

    let branch_id = BranchId::generate();
    let depth = chat.branches.active_branch_path.len();

    let chat_id = chat.id.clone();
    let parent = chat
        .message_mut(&parent_message_id)
        .context(MessageNotFoundSnafu {
            stage: "create-branch-load-parent",
            chat_id,
            message_id: parent_message_id.clone(),
        })?;
    parent.branch_point = true;
    parent.children.push(draft.id.clone());
    let parent_branch_id = parent.branch_id.clone();

    if let Some(parent_node) = chat.branches.branch_tree.get_mut(&parent_branch_id) {
        parent_node.child_branches.push(branch_id.clone());
    }

    chat.branches.branch_tree.insert(
        branch_id.clone(),
        BranchNode {
            id: branch_id.clone(),
            message_id: parent_message_id.clone(),
            depth,
            child_branches: Vec::new(),
        },
    );
    chat.branches
        .message_branches
        .entry(parent_message_id.clone())
        .or_default()
        .push(branch_id.clone());

    draft.branch_id = branch_id.clone();
    draft.parent_id = Some(parent_message_id.clone());
    chat.push_message(draft);

    tracing::debug!(
        chat_id = %chat.id,
        branch_id = %branch_id,
        parent_message_id = %parent_message_id,
        depth,
        "created branch"
    );
    Ok(branch_id)
}

/// Rebuilds the path from `main` to `target_branch_id` by following divergence points.
///
/// Unknown nodes or divergence messages fail open to `[main, target]`. A path that revisits
/// a branch or grows past `branch count + 1` is reported as a corrupt tree.
pub fn build_branch_path(
    chat: &Chat,
    target_branch_id: &BranchId,
) -> BranchResult<Vec<BranchId>> {
    // An unknown target still gets its own segment when failing open.
    let unknown_target =
        chat.branches.node(target_branch_id).is_none() && !target_branch_id.is_main();
    let limit = chat.branches.branch_count() + 1 + usize::from(unknown_target);
    let mut reversed = vec![target_branch_id.clone()];
    let mut visited = HashSet::from([target_branch_id.clone()]);
    let mut current = target_branch_id.clone();

    while !current.is_main() {
        let parent_branch_id = match chat
            .branches
            .node(&current)
            .and_then(|node| chat.message(&node.message_id))
        {
            Some(divergence_message) => divergence_message.branch_id.clone(),
            None => {
                tracing::warn!(
                    chat_id = %chat.id,
                    branch_id = %current,
                    "branch node or divergence message missing; attaching branch to main"
                );
                BranchId::main()
            }
        };

        if !visited.insert(parent_branch_id.clone()) {
            return CorruptBranchTreeSnafu {
                stage: "build-branch-path-cycle",
                chat_id: chat.id.clone(),
                branch_id: target_branch_id.clone(),
                details: format!("branch '{parent_branch_id}' is its own ancestor"),
            }
            .fail();
        }

        reversed.push(parent_branch_id.clone());
        if reversed.len() > limit {
            return CorruptBranchTreeSnafu {
                stage: "build-branch-path-bound",
                chat_id: chat.id.clone(),
                branch_id: target_branch_id.clone(),
                details: format!("path exceeds {limit} segments"),
            }
            .fail();
        }
        current = parent_branch_id;
    }

    reversed.reverse();
    Ok(reversed)
}

/// Makes `target_branch_id` the visible leaf and returns the new active path.
pub fn switch_to_branch(
    chat: &mut Chat,
    target_branch_id: &BranchId,
) -> BranchResult<Vec<BranchId>> {
    let path = build_branch_path(chat, target_branch_id)?;
    chat.branches.active_branch_path = path.clone();
    chat.touch();

    tracing::debug!(chat_id = %chat.id, path = ?path, "switched active branch");
    Ok(path)
}

/// Removes a branch, its messages and every branch diverging from inside it.
///
/// Divergence points left without sibling branches lose their `branch_point` flag. If the
/// active path ran through a removed branch it falls back to `[main]`.
pub fn delete_branch(chat: &mut Chat, branch_id: &BranchId) -> BranchResult<()> {
    if branch_id.is_main() {
        return RootBranchImmutableSnafu {
            stage: "delete-branch",
        }
        .fail();
    }

    let has_messages = chat
        .messages
        .iter()
        .any(|message| &message.branch_id == branch_id);
    if chat.branches.node(branch_id).is_none() && !has_messages {
        return BranchNotFoundSnafu {
            stage: "delete-branch-lookup",
            chat_id: chat.id.clone(),
            branch_id: branch_id.clone(),
        }
        .fail();
    }

    let doomed_branches = collect_descendants(chat, branch_id);
    let doomed_messages: HashSet<MessageId> = chat
        .messages
        .iter()
        .filter(|message| doomed_branches.contains(&message.branch_id))
        .map(|message| message.id.clone())
        .collect();

    let mut divergence_points = BTreeSet::new();
    for doomed in &doomed_branches {
        if let Some(node) = chat.branches.branch_tree.remove(doomed) {
            divergence_points.insert(node.message_id);
        }
    }
    for node in chat.branches.branch_tree.values_mut() {
        node.child_branches
            .retain(|child| !doomed_branches.contains(child));
    }

    chat.branches.message_branches.retain(|message_id, branches| {
        branches.retain(|branch| !doomed_branches.contains(branch));
        !branches.is_empty() && !doomed_messages.contains(message_id)
    });

    chat.messages
        .retain(|message| !doomed_branches.contains(&message.branch_id));

    for divergence_point in divergence_points {
        let still_branched = chat
            .branches
            .message_branches
            .contains_key(&divergence_point);
        if let Some(message) = chat.message_mut(&divergence_point) {
            message
                .children
                .retain(|child| !doomed_messages.contains(child));
            if !still_branched {
                message.branch_point = false;
            }
        }
    }

    if chat
        .branches
        .active_branch_path
        .iter()
        .any(|segment| doomed_branches.contains(segment))
    {
        chat.branches.active_branch_path = vec![BranchId::main()];
    }
    chat.touch();

    tracing::debug!(
        chat_id = %chat.id,
        branch_id = %branch_id,
        removed_branches = doomed_branches.len(),
        removed_messages = doomed_messages.len(),
        "deleted branch"
    );
    Ok(())
}

// The branch itself plus every branch whose divergence point lies inside a removed branch.
fn collect_descendants(chat: &Chat, branch_id: &BranchId) -> HashSet<BranchId> {
    let mut doomed = HashSet::from([branch_id.clone()]);
    loop {
        let next = chat
            .branches
            .branch_tree
            .values()
            .filter(|node| !doomed.contains(&node.id))
            .filter(|node| {
                chat.message(&node.message_id)
                    .is_some_and(|message| doomed.contains(&message.branch_id))
            })
            .map(|node| node.id.clone())
            .collect::<Vec<_>>();

        if next.is_empty() {
            return doomed;
        }
        doomed.extend(next);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::error::BranchError;
    use crate::ids::ChatId;

    fn chat_with_linear_history(texts: &[&str]) -> (Chat, Vec<MessageId>) {
        let mut chat = Chat::new(ChatId::new("chat-test"), "test");
        let start = Utc::now();
        let mut ids = Vec::new();
        for (index, text) in texts.iter().enumerate() {
            let message =
                Message::user(*text).with_timestamp(start + Duration::seconds(index as i64));
            ids.push(message.id.clone());
            chat.push_message(message);
        }
        (chat, ids)
    }

    #[test]
    fn branching_twice_from_same_message_keeps_versions_as_siblings() {
        let (mut chat, ids) = chat_with_linear_history(&["a", "b"]);

        let first = create_branch_from_message(&mut chat, &ids[1], Message::user("b2"))
            .expect("first branch");
        let first_version = chat
            .messages
            .iter()
            .find(|message| message.branch_id == first)
            .map(|message| message.id.clone())
            .expect("first branch message");

        // Branching from the branched version reuses its divergence point.
        let second = create_branch_from_message(&mut chat, &first_version, Message::user("b3"))
            .expect("second branch");

        let divergence = chat.message(&ids[1]).expect("divergence message");
        assert!(divergence.branch_point);
        assert_eq!(divergence.children.len(), 2);
        assert_eq!(
            chat.branches.message_branches.get(&ids[1]),
            Some(&vec![first.clone(), second.clone()])
        );
        assert_eq!(chat.branches.node(&second).map(|node| &node.message_id), Some(&ids[1]));
    }

    #[test]
    fn switching_walks_nested_divergence_points() {
        let (mut chat, ids) = chat_with_linear_history(&["a", "b"]);
        let outer = create_branch_from_message(&mut chat, &ids[0], Message::user("a2"))
            .expect("outer branch");
        switch_to_branch(&mut chat, &outer).expect("switch outer");

        let follow_up = Message::user("inside outer")
            .with_branch(outer.clone())
            .with_timestamp(Utc::now() + Duration::seconds(10));
        let follow_up_id = follow_up.id.clone();
        chat.push_message(follow_up);

        let inner = create_branch_from_message(&mut chat, &follow_up_id, Message::user("inner"))
            .expect("inner branch");
        let path = switch_to_branch(&mut chat, &inner).expect("switch inner");

        assert_eq!(path, vec![BranchId::main(), outer.clone(), inner.clone()]);
        assert!(path.len() <= chat.branches.branch_count() + 1);
        assert_eq!(
            chat.branches.node(&outer).map(|node| node.child_branches.clone()),
            Some(vec![inner])
        );
    }

    #[test]
    fn switching_to_main_resets_to_root() {
        let (mut chat, ids) = chat_with_linear_history(&["a"]);
        let branch = create_branch_from_message(&mut chat, &ids[0], Message::user("a2"))
            .expect("branch");
        switch_to_branch(&mut chat, &branch).expect("switch branch");

        let path = switch_to_branch(&mut chat, &BranchId::main()).expect("switch main");
        assert_eq!(path, vec![BranchId::main()]);
    }

    #[test]
    fn unknown_branch_fails_open_to_main() {
        let (chat, _) = chat_with_linear_history(&["a"]);
        let ghost = BranchId::new("branch-ghost");
        let path = build_branch_path(&chat, &ghost).expect("fail-open path");
        assert_eq!(path, vec![BranchId::main(), ghost]);
    }

    #[test]
    fn cyclic_tree_is_rejected() {
        let (mut chat, ids) = chat_with_linear_history(&["a"]);
        let branch = create_branch_from_message(&mut chat, &ids[0], Message::user("a2"))
            .expect("branch");
        let branched_message = chat
            .messages
            .iter()
            .find(|message| message.branch_id == branch)
            .map(|message| message.id.clone())
            .expect("branched message");

        // Corrupt the tree: the branch now diverges from one of its own messages.
        if let Some(node) = chat.branches.branch_tree.get_mut(&branch) {
            node.message_id = branched_message;
        }

        let error = build_branch_path(&chat, &branch).expect_err("cycle must be detected");
        assert!(matches!(error, BranchError::CorruptBranchTree { .. }));
    }

    #[test]
    fn deleting_last_sibling_clears_branch_point_and_resets_path() {
        let (mut chat, ids) = chat_with_linear_history(&["a", "b"]);
        let branch = create_branch_from_message(&mut chat, &ids[1], Message::user("b2"))
            .expect("branch");
        switch_to_branch(&mut chat, &branch).expect("switch");

        delete_branch(&mut chat, &branch).expect("delete");

        assert_eq!(chat.messages.len(), 2);
        assert!(chat.branches.branch_tree.is_empty());
        assert!(chat.branches.message_branches.is_empty());
        let divergence = chat.message(&ids[1]).expect("divergence message");
        assert!(!divergence.branch_point);
        assert!(divergence.children.is_empty());
        assert_eq!(chat.active_branch_path(), &[BranchId::main()]);
    }

    #[test]
    fn deleting_one_of_two_siblings_keeps_branch_point() {
        let (mut chat, ids) = chat_with_linear_history(&["a"]);
        let first = create_branch_from_message(&mut chat, &ids[0], Message::user("a2"))
            .expect("first");
        let second = create_branch_from_message(&mut chat, &ids[0], Message::user("a3"))
            .expect("second");

        delete_branch(&mut chat, &first).expect("delete first");

        let divergence = chat.message(&ids[0]).expect("divergence message");
        assert!(divergence.branch_point);
        assert_eq!(
            chat.branches.message_branches.get(&ids[0]),
            Some(&vec![second])
        );
    }

    #[test]
    fn deleting_main_is_rejected() {
        let (mut chat, _) = chat_with_linear_history(&["a"]);
        let error = delete_branch(&mut chat, &BranchId::main()).expect_err("main is immutable");
        assert!(matches!(error, BranchError::RootBranchImmutable { .. }));
        assert_eq!(chat.messages.len(), 1);
    }

    #[test]
    fn deleting_a_branch_removes_nested_branches() {
        let (mut chat, ids) = chat_with_linear_history(&["a"]);
        let outer = create_branch_from_message(&mut chat, &ids[0], Message::user("a2"))
            .expect("outer");
        let outer_message = chat
            .messages
            .iter()
            .find(|message| message.branch_id == outer)
            .map(|message| message.id.clone())
            .expect("outer message");
        let reply = Message::user("reply")
            .with_branch(outer.clone())
            .with_timestamp(Utc::now() + Duration::seconds(5));
        let reply_id = reply.id.clone();
        chat.push_message(reply);
        let inner = create_branch_from_message(&mut chat, &reply_id, Message::user("reply2"))
            .expect("inner");

        delete_branch(&mut chat, &outer).expect("delete outer");

        assert!(chat.branches.node(&inner).is_none());
        assert!(!chat.contains_message(&outer_message));
        assert!(chat.messages.iter().all(|message| message.branch_id.is_main()));
    }
}
