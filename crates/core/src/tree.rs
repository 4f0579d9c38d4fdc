//! Conversation-tree reconstruction and preference-thread extraction.
//!
//! The raw dump is a flat message sequence in which every node's
//! descendants appear contiguously right after it. Reconstruction and
//! extraction both run on an index-based arena with explicit work stacks,
//! so arbitrarily deep conversation chains cannot overflow the call
//! stack.

use crate::corpus::OaRow;
use crate::thread::{ThreadBuilder, ThreadMap};
use crate::ASSISTANT_MARKER;

/// Speaker role of one conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Human,
    Assistant,
}

/// One message in the reconstructed conversation tree.
#[derive(Debug)]
pub struct MessageNode {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub deleted: bool,
    pub passed_review: bool,
    pub rank: Option<i64>,
    /// Arena indices of the replies, in corpus order.
    pub replies: Vec<usize>,
}

/// A rooted conversation tree stored as an index-based arena.
///
/// Node 0 is a synthetic root whose replies are the top-level human
/// messages; messages without a parent reference attach under it.
#[derive(Debug)]
pub struct MessageTree {
    nodes: Vec<MessageNode>,
}

const ROOT: usize = 0;
const ROOT_ID: &str = "root_node";

impl MessageTree {
    /// Reconstruct the tree from a flat message sequence.
    ///
    /// The grouped-by-parent ordering is an assumed precondition, not
    /// verified: a message whose parent is not on the current ancestor
    /// path stops the scan, and it and everything after it is silently
    /// dropped.
    pub fn build(rows: Vec<OaRow>) -> Self {
        let mut nodes = vec![MessageNode {
            id: ROOT_ID.to_string(),
            role: Role::Human,
            text: String::new(),
            deleted: false,
            passed_review: false,
            rank: None,
            replies: Vec::new(),
        }];
        let mut stack = vec![ROOT];
        let mut queue = rows.into_iter().peekable();
        while let Some(next) = queue.peek() {
            let parent_ref = next.parent_id.as_deref().unwrap_or(ROOT_ID);
            let top = stack.last().copied().unwrap_or(ROOT);
            if parent_ref == nodes[top].id {
                let row = match queue.next() {
                    Some(row) => row,
                    None => break,
                };
                let child = nodes.len();
                nodes.push(MessageNode {
                    id: row.message_id,
                    role: if row.role == "prompter" {
                        Role::Human
                    } else {
                        Role::Assistant
                    },
                    text: row.text,
                    deleted: row.deleted,
                    passed_review: row.review_result,
                    rank: row.rank,
                    replies: Vec::new(),
                });
                nodes[top].replies.push(child);
                stack.push(child);
            } else if top == ROOT {
                break;
            } else {
                stack.pop();
            }
        }
        Self { nodes }
    }

    /// Arena indices of the top-level human messages.
    pub fn roots(&self) -> &[usize] {
        &self.nodes[ROOT].replies
    }

    pub fn node(&self, index: usize) -> &MessageNode {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut MessageNode {
        &mut self.nodes[index]
    }

    /// Number of nodes, synthetic root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// True when the node has no replies or every reply is deleted.
    pub fn is_terminal(&self, index: usize) -> bool {
        self.nodes[index]
            .replies
            .iter()
            .all(|&reply| self.nodes[reply].deleted)
    }
}

/// Walk the tree and emit one canonical thread per human-turn branch
/// point that owns at least one reviewed, terminal reply. A single
/// conversation can yield several overlapping threads, one per
/// qualifying branch point along it.
pub fn extract_threads(tree: &mut MessageTree, data: &mut ThreadMap) {
    let mut work: Vec<(usize, String)> = tree
        .roots()
        .iter()
        .rev()
        .map(|&root| (root, String::new()))
        .collect();
    while let Some((index, conversation)) = work.pop() {
        visit(tree, index, &conversation, data, &mut work);
    }
}

fn visit(
    tree: &mut MessageTree,
    index: usize,
    conversation: &str,
    data: &mut ThreadMap,
    work: &mut Vec<(usize, String)>,
) {
    let (role, extended) = {
        let node = tree.node(index);
        let marker = match node.role {
            Role::Human => "Human",
            Role::Assistant => "Assistant",
        };
        let turn = format!("{marker}: {}", node.text);
        let extended = if conversation.is_empty() {
            turn
        } else {
            format!("{conversation}\n\n{turn}")
        };
        (node.role, extended)
    };

    if tree.is_terminal(index) {
        return;
    }

    match role {
        Role::Assistant => {
            // an assistant turn always continues into its human follow-ups
            for &reply in tree.node(index).replies.clone().iter().rev() {
                work.push((reply, extended.clone()));
            }
        }
        Role::Human => {
            let replies = tree.node(index).replies.clone();

            // A next-layer human turn with no reviewed, live assistant
            // reply is a dead end; propagate that one level up so the
            // terminal test below sees it.
            for &assistant_reply in &replies {
                for human_reply in tree.node(assistant_reply).replies.clone() {
                    let has_live_continuation =
                        tree.node(human_reply).replies.iter().any(|&answer| {
                            let node = tree.node(answer);
                            !node.deleted && node.passed_review
                        });
                    if !has_live_continuation {
                        tree.node_mut(human_reply).deleted = true;
                    }
                }
            }

            // a null rank counts as the lowest rank
            for &reply in &replies {
                if tree.node(reply).rank.is_none() {
                    tree.node_mut(reply).rank = Some(0);
                }
            }

            let has_ending = replies
                .iter()
                .any(|&reply| tree.node(reply).passed_review && tree.is_terminal(reply));
            if has_ending {
                let key = format!("{extended}{ASSISTANT_MARKER} ");
                let mut builder = ThreadBuilder::new();
                for (i, &reply_i) in replies.iter().enumerate() {
                    let rank_i = tree.node(reply_i).rank.unwrap_or(0);
                    // every direct reply joins the response list, whatever
                    // its deleted/review status
                    builder.add_scored_response(tree.node(reply_i).text.clone(), rank_i);
                    for (j, &reply_j) in replies.iter().enumerate().skip(i + 1) {
                        let rank_j = tree.node(reply_j).rank.unwrap_or(0);
                        // equal ranks fall through to the later index
                        if rank_i > rank_j {
                            builder.add_pair(i, j);
                        } else {
                            builder.add_pair(j, i);
                        }
                    }
                }
                if replies.len() == 1 {
                    // a lone candidate still needs a pair to train on
                    builder.add_response(String::new());
                    builder.add_pair(0, 1);
                }
                data.replace(&key, builder);
            }

            for &reply in replies.iter().rev() {
                if !tree.is_terminal(reply) && tree.node(reply).passed_review {
                    work.push((reply, extended.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(
        id: &str,
        parent: Option<&str>,
        role: &str,
        text: &str,
        rank: Option<i64>,
        deleted: bool,
        review: bool,
    ) -> OaRow {
        OaRow {
            message_id: id.to_string(),
            parent_id: parent.map(str::to_string),
            text: text.to_string(),
            role: role.to_string(),
            rank,
            deleted,
            review_result: review,
        }
    }

    fn extract(rows: Vec<OaRow>) -> Vec<crate::PreferenceThread> {
        let mut tree = MessageTree::build(rows);
        let mut data = ThreadMap::new();
        extract_threads(&mut tree, &mut data);
        data.finalize().unwrap()
    }

    #[test]
    fn test_build_reconstructs_parent_edges() {
        let rows = vec![
            row("m1", None, "prompter", "Q", None, false, true),
            row("m2", Some("m1"), "assistant", "A", Some(1), false, true),
            row("m3", Some("m2"), "prompter", "Q2", None, false, true),
            row("m4", Some("m1"), "assistant", "B", Some(0), false, true),
            row("m5", None, "prompter", "Q3", None, false, true),
        ];
        let tree = MessageTree::build(rows);
        // every message visited exactly once
        assert_eq!(tree.len(), 6);
        assert_eq!(tree.roots().len(), 2);
        let m1 = tree.roots()[0];
        assert_eq!(tree.node(m1).id, "m1");
        assert_eq!(tree.node(m1).replies.len(), 2);
        let m2 = tree.node(m1).replies[0];
        assert_eq!(tree.node(m2).id, "m2");
        assert_eq!(tree.node(m2).replies.len(), 1);
        assert_eq!(tree.node(tree.node(m2).replies[0]).id, "m3");
        assert_eq!(tree.node(tree.roots()[1]).id, "m5");
    }

    #[test]
    fn test_build_drops_out_of_place_messages() {
        let rows = vec![
            row("m1", None, "prompter", "Q", None, false, true),
            row("m2", Some("orphaned"), "assistant", "A", None, false, true),
            row("m3", Some("m1"), "assistant", "B", None, false, true),
        ];
        let tree = MessageTree::build(rows);
        // the scan stops at m2; m3 is dropped with it
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.node(tree.roots()[0]).replies.len(), 0);
    }

    #[test]
    fn test_single_reply_gets_filler_pair() {
        let rows = vec![
            row("m1", None, "prompter", "Hi", None, false, true),
            row("m2", Some("m1"), "assistant", "Hello!", None, false, true),
        ];
        let threads = extract(rows);
        assert_eq!(threads.len(), 1);
        let thread = &threads[0];
        assert_eq!(thread.prompt, "Human: Hi\n\nAssistant: ");
        assert_eq!(thread.responses, vec!["Hello!", ""]);
        assert_eq!(thread.pairs, vec![(0, 1)]);
        assert_eq!(thread.sft_target, "Hello!");
    }

    #[test]
    fn test_equal_ranks_prefer_later_index() {
        let rows = vec![
            row("m1", None, "prompter", "Q", None, false, true),
            row("m2", Some("m1"), "assistant", "A", Some(1), false, true),
            row("m3", Some("m1"), "assistant", "B", Some(1), false, true),
        ];
        let threads = extract(rows);
        assert_eq!(threads.len(), 1);
        let thread = &threads[0];
        assert_eq!(thread.responses, vec!["A", "B"]);
        assert_eq!(thread.pairs, vec![(1, 0)]);
        // the SFT target keeps the first occurrence of the top rank
        assert_eq!(thread.sft_target, "A");
    }

    #[test]
    fn test_dead_end_propagation_creates_ending() {
        // m3 has no reviewed assistant reply, so it is marked deleted,
        // which makes m2 terminal and lets the branch point emit.
        let rows = vec![
            row("m1", None, "prompter", "Q", None, false, true),
            row("m2", Some("m1"), "assistant", "A1", Some(1), false, true),
            row("m3", Some("m2"), "prompter", "Q2", None, false, true),
            row("m4", Some("m3"), "assistant", "A2", None, false, false),
            row("m5", Some("m1"), "assistant", "A3", Some(0), false, false),
        ];
        let threads = extract(rows);
        assert_eq!(threads.len(), 1);
        let thread = &threads[0];
        assert_eq!(thread.prompt, "Human: Q\n\nAssistant: ");
        // unreviewed replies still appear among the responses
        assert_eq!(thread.responses, vec!["A1", "A3"]);
        assert_eq!(thread.pairs, vec![(0, 1)]);
        assert_eq!(thread.sft_target, "A1");
    }

    #[test]
    fn test_branch_points_emit_overlapping_threads() {
        let rows = vec![
            row("m1", None, "prompter", "Q", None, false, true),
            row("m2", Some("m1"), "assistant", "A", Some(1), false, true),
            row("m3", Some("m2"), "prompter", "Q2", None, false, true),
            row("m4", Some("m3"), "assistant", "A2", None, false, true),
            row("m5", Some("m1"), "assistant", "B", Some(0), false, true),
        ];
        let threads = extract(rows);
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].prompt, "Human: Q\n\nAssistant: ");
        assert_eq!(threads[0].responses, vec!["A", "B"]);
        assert_eq!(threads[0].pairs, vec![(0, 1)]);
        assert_eq!(threads[0].sft_target, "A");
        assert_eq!(
            threads[1].prompt,
            "Human: Q\n\nAssistant: A\n\nHuman: Q2\n\nAssistant: "
        );
        assert_eq!(threads[1].responses, vec!["A2", ""]);
        assert_eq!(threads[1].pairs, vec![(0, 1)]);
    }

    #[test]
    fn test_deleted_terminal_replies_do_not_emit() {
        let rows = vec![
            row("m1", None, "prompter", "Q", None, false, true),
            row("m2", Some("m1"), "assistant", "A", None, true, true),
        ];
        let threads = extract(rows);
        // m1's only reply is deleted, so m1 itself is terminal
        assert!(threads.is_empty());
    }
}
