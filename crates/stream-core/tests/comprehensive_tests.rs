//! # comprehensive core tests
//!
//! why: verify the storage-independent building blocks behave as the log and leadership rely on
//! relations: tests stream-core only
//! what: journal framing, record model, quorum properties, election scenarios

use serde_json::json;
use stream_core::{
    decode_block, encode_block, CodecError, ElectionCoordinator, ElectionOutcome, JournalEntry,
    LoggedRecord, NodeRole, Quorum, Record, RecordType,
};

// =============================================================================
// SECTION 1: JOURNAL FRAMING
// =============================================================================

mod journal_framing {
    use super::*;

    #[test]
    fn size_is_derived_from_payload() {
        let entry = JournalEntry::new(10, b"hello".to_vec());
        assert_eq!(entry.index(), 10);
        assert_eq!(entry.size(), 5);
        assert_eq!(entry.framed_length(), 12 + 5);
    }

    #[test]
    fn block_keeps_entries_in_order() {
        let entries = vec![
            JournalEntry::new(4, b"a".to_vec()),
            JournalEntry::new(5, Vec::new()),
            JournalEntry::new(6, b"ccc".to_vec()),
        ];
        let block = encode_block(&entries).unwrap();
        assert_eq!(
            block.len(),
            entries.iter().map(JournalEntry::framed_length).sum::<usize>()
        );

        let decoded = decode_block(&block).unwrap();
        let indexes: Vec<u64> = decoded.iter().map(JournalEntry::index).collect();
        assert_eq!(indexes, vec![4, 5, 6]);
        assert_eq!(decoded[2].payload(), b"ccc");
    }

    #[test]
    fn header_is_little_endian() {
        let block = encode_block(&[JournalEntry::new(1, b"xy".to_vec())]).unwrap();
        assert_eq!(&block[..8], &1u64.to_le_bytes());
        assert_eq!(&block[8..12], &2u32.to_le_bytes());
        assert_eq!(&block[12..], b"xy");
    }

    #[test]
    fn encoding_rejects_decreasing_indexes() {
        let entries = vec![JournalEntry::new(3, vec![]), JournalEntry::new(3, vec![])];
        assert_eq!(
            encode_block(&entries),
            Err(CodecError::NonIncreasingIndex {
                previous: 3,
                index: 3
            })
        );
    }

    #[test]
    fn truncated_block_is_reported() {
        let block = encode_block(&[JournalEntry::new(1, b"payload".to_vec())]).unwrap();
        let result = decode_block(&block[..block.len() - 2]);
        assert!(matches!(result, Err(CodecError::Truncated { offset: 0, .. })));
    }

    #[test]
    fn empty_block_decodes_to_nothing() {
        assert!(decode_block(&[]).unwrap().is_empty());
    }
}

// =============================================================================
// SECTION 2: RECORDS
// =============================================================================

mod records {
    use super::*;

    #[test]
    fn commands_and_events_differ_only_in_type() {
        let command = Record::command(1, "job", "create", json!({ "retries": 3 }));
        let event = Record::event(1, "job", "create", json!({ "retries": 3 }));

        assert!(command.is_command());
        assert!(!event.is_command());
        assert_eq!(event.record_type, RecordType::Event);
        assert_eq!(command.value, event.value);
    }

    #[test]
    fn rejection_copies_command_and_reason() {
        let command = Record::command(9, "job", "complete", json!({}));
        let rejection = Record::rejection(&command, "job 9 is not activated");

        assert!(rejection.is_rejection());
        assert_eq!(rejection.key, 9);
        assert_eq!(rejection.intent, "complete");
        assert_eq!(
            rejection.rejection_reason.as_deref(),
            Some("job 9 is not activated")
        );
    }

    #[test]
    fn logged_record_decodes_from_journal_entry() {
        let record = Record::event(2, "job", "created", json!({})).with_source_position(1);
        let entry = JournalEntry::new(5, record.to_payload().unwrap());

        let logged = LoggedRecord::from_entry(&entry).unwrap();
        assert_eq!(logged.position, 5);
        assert_eq!(logged.record, record);
    }

    #[test]
    fn optional_fields_are_omitted_from_payload() {
        let payload = Record::command(1, "job", "create", json!({}))
            .to_payload()
            .unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(!text.contains("source_position"));
        assert!(!text.contains("rejection_reason"));
    }

    #[test]
    fn garbage_payload_is_an_error() {
        let entry = JournalEntry::new(1, b"not json".to_vec());
        assert!(LoggedRecord::from_entry(&entry).is_err());
    }
}

// =============================================================================
// SECTION 3: QUORUM PROPERTIES
// =============================================================================

mod quorum_properties {
    use super::*;

    #[test]
    fn majority_of_successes_elects() {
        for required in 1..=5 {
            let mut quorum = Quorum::new();
            quorum.open(required);
            for _ in 1..required {
                assert!(!quorum.is_completed(), "required {required}");
                quorum.succeed();
            }
            assert!(quorum.is_completed(), "required {required}");
            assert!(quorum.is_elected(), "required {required}");
        }
    }

    #[test]
    fn majority_of_failures_completes_without_election() {
        for required in 2..=5 {
            let mut quorum = Quorum::new();
            quorum.open(required);
            for _ in 0..required {
                quorum.fail();
            }
            assert!(quorum.is_completed(), "required {required}");
            assert!(!quorum.is_elected(), "required {required}");
        }
    }

    #[test]
    fn stepdown_overrides_counts() {
        let mut quorum = Quorum::new();
        quorum.open(2);
        quorum.succeed();
        assert!(quorum.is_elected());

        quorum.stepdown();
        assert!(quorum.is_completed());
        assert!(!quorum.is_elected());

        let mut quorum = Quorum::new();
        quorum.open(3);
        quorum.stepdown();
        assert!(quorum.is_completed());
        assert!(!quorum.is_elected());
    }

    #[test]
    fn counting_is_order_independent() {
        let mut first = Quorum::new();
        first.open(3);
        first.fail().succeed().fail().succeed();

        let mut second = Quorum::new();
        second.open(3);
        second.succeed().succeed().fail().fail();

        assert_eq!(first.is_elected(), second.is_elected());
        assert_eq!(first.succeeded(), second.succeeded());
        assert_eq!(first.failed(), second.failed());
    }

    #[test]
    fn completion_sticks_until_closed() {
        let mut quorum = Quorum::new();
        quorum.open(2);
        quorum.succeed();
        quorum.fail().fail();
        assert!(quorum.is_completed());

        quorum.close();
        assert!(!quorum.is_completed());
    }

    #[test]
    fn reopen_resets_counts() {
        let mut quorum = Quorum::new();
        quorum.open(3);
        quorum.fail().fail().fail().stepdown();

        quorum.open(3);
        assert_eq!(quorum.succeeded(), 1);
        assert_eq!(quorum.failed(), 0);
        assert!(!quorum.is_completed());
        assert_eq!(quorum.required_votes(), 3);
    }
}

// =============================================================================
// SECTION 4: ELECTIONS
// =============================================================================

mod elections {
    use super::*;

    #[test]
    fn required_votes_is_majority_of_members() {
        let cases = [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (7, 4)];
        for (size, expected) in cases {
            let members: Vec<u64> = (1..=size).collect();
            let coordinator = ElectionCoordinator::new(1, members);
            assert_eq!(coordinator.required_votes(), expected, "{size} members");
        }
    }

    #[test]
    fn candidate_wins_with_majority() {
        let mut coordinator = ElectionCoordinator::new(1, vec![1, 2, 3, 4, 5]);
        let term = coordinator.start_election();
        assert_eq!(term, 1);
        assert_eq!(coordinator.role(), NodeRole::Candidate);

        assert_eq!(coordinator.on_vote(term, true), ElectionOutcome::Pending);
        assert_eq!(coordinator.on_vote(term, false), ElectionOutcome::Pending);
        assert_eq!(coordinator.on_vote(term, true), ElectionOutcome::Elected);

        assert!(coordinator.is_leader());
        assert_eq!(coordinator.leader(), Some(1));
    }

    #[test]
    fn majority_of_rejections_loses() {
        let mut coordinator = ElectionCoordinator::new(1, vec![1, 2, 3]);
        let term = coordinator.start_election();

        assert_eq!(coordinator.on_vote(term, false), ElectionOutcome::Pending);
        assert_eq!(coordinator.on_vote(term, false), ElectionOutcome::Lost);
        assert_eq!(coordinator.role(), NodeRole::Follower);
        assert_eq!(coordinator.leader(), None);
    }

    #[test]
    fn votes_for_stale_terms_are_ignored() {
        let mut coordinator = ElectionCoordinator::new(1, vec![1, 2, 3]);
        coordinator.start_election();
        let term = coordinator.start_election();
        assert_eq!(term, 2);

        assert_eq!(coordinator.on_vote(1, true), ElectionOutcome::Pending);
        assert_eq!(coordinator.role(), NodeRole::Candidate);
        assert_eq!(coordinator.on_vote(2, true), ElectionOutcome::Elected);
    }

    #[test]
    fn higher_term_vote_steps_candidate_down() {
        let mut coordinator = ElectionCoordinator::new(1, vec![1, 2, 3]);
        coordinator.start_election();

        assert_eq!(coordinator.on_vote(4, false), ElectionOutcome::Lost);
        assert_eq!(coordinator.term(), 4);
        assert_eq!(coordinator.role(), NodeRole::Follower);

        // late votes of the abandoned election change nothing
        assert_eq!(coordinator.on_vote(1, true), ElectionOutcome::Lost);
    }

    #[test]
    fn observed_leader_is_followed() {
        let mut coordinator = ElectionCoordinator::new(1, vec![1, 2, 3]);
        coordinator.start_election();

        coordinator.observe_leader(1, 2);
        assert_eq!(coordinator.role(), NodeRole::Follower);
        assert_eq!(coordinator.leader(), Some(2));

        coordinator.observe_leader(0, 3);
        assert_eq!(coordinator.leader(), Some(2));
    }

    #[test]
    fn leader_steps_down_on_newer_leader() {
        let mut coordinator = ElectionCoordinator::new(1, vec![1]);
        coordinator.start_election();
        assert!(coordinator.is_leader());

        coordinator.observe_leader(5, 2);
        assert!(!coordinator.is_leader());
        assert_eq!(coordinator.term(), 5);
        assert_eq!(coordinator.leader(), Some(2));
    }
}
