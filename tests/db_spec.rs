use chrono::{DateTime, Duration, TimeZone, Utc};
use rollcall::db::Database;
use rollcall::models::*;
use rollcall::Error;
use speculate2::speculate;
use uuid::Uuid;

fn at(min: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap() + Duration::minutes(min)
}

fn open_test_session(db: &Database, class_id: &str) -> ClassSession {
    db.create_session(OpenSessionInput::starting_at(class_id, at(0)), "tester")
        .expect("Failed to open session")
}

fn enroll(db: &Database, name: &str, tag: &str) -> Student {
    db.create_student(CreateStudentInput {
        name: name.to_string(),
        rfid_tag: tag.to_string(),
    })
    .expect("Failed to enroll student")
}

fn collect(db: &Database, session_id: Uuid, range: TimeRange) -> Vec<AttendanceEvent> {
    db.query_events(session_id, range)
        .expect("Query failed")
        .iter()
        .collect::<rollcall::Result<Vec<_>>>()
        .expect("Iteration failed")
}

speculate! {
    before {
        let db = Database::open_memory().expect("Failed to create in-memory database");
        db.migrate().expect("Failed to run migrations");
    }

    describe "sessions" {
        describe "create_session" {
            it "opens a session with the given start" {
                let session = open_test_session(&db, "cs101");

                assert_eq!(session.class_id, "cs101");
                assert_eq!(session.status, SessionStatus::Open);
                assert_eq!(session.start_time, at(0));
                assert!(session.end_time.is_none());
                assert_eq!(session.opened_by, "tester");
            }

            it "refuses a second open session for the same class" {
                open_test_session(&db, "cs101");

                let result = db.create_session(OpenSessionInput::new("cs101"), "tester");
                assert!(matches!(result, Err(Error::SessionAlreadyOpen(ref c)) if c == "cs101"));
            }

            it "allows open sessions for different classes" {
                open_test_session(&db, "cs101");
                open_test_session(&db, "ma201");

                assert!(db.open_session_for_class("cs101").unwrap().is_some());
                assert!(db.open_session_for_class("ma201").unwrap().is_some());
            }

            it "rejects a start far in the future" {
                let later = Utc::now() + Duration::days(2);
                let result = db.create_session(OpenSessionInput::starting_at("cs101", later), "tester");
                assert!(matches!(result, Err(Error::InvalidEvent(_))));
                assert!(db.open_session_for_class("cs101").unwrap().is_none());
            }

            it "rejects an empty class id" {
                let result = db.create_session(OpenSessionInput::new("  "), "tester");
                assert!(matches!(result, Err(Error::InvalidEvent(_))));
            }
        }

        describe "close_session" {
            it "closes an open session" {
                let session = open_test_session(&db, "cs101");

                let closed = db.close_session(session.id, Some(at(50))).expect("Failed to close");
                assert_eq!(closed.status, SessionStatus::Closed);
                assert_eq!(closed.end_time, Some(at(50)));

                let stored = db.get_session(session.id).unwrap().unwrap();
                assert_eq!(stored, closed);
            }

            it "never ends before the start" {
                let session = open_test_session(&db, "cs101");

                let closed = db.close_session(session.id, Some(at(-10))).expect("Failed to close");
                assert_eq!(closed.end_time, Some(at(0)));
            }

            it "rejects an end far in the future" {
                let session = open_test_session(&db, "cs101");
                let later = Utc::now() + Duration::days(2);

                let result = db.close_session(session.id, Some(later));
                assert!(matches!(result, Err(Error::InvalidEvent(_))));
                assert_eq!(db.get_session(session.id).unwrap().unwrap().status, SessionStatus::Open);
            }

            it "fails on a closed session" {
                let session = open_test_session(&db, "cs101");
                db.close_session(session.id, Some(at(50))).unwrap();

                let result = db.close_session(session.id, Some(at(60)));
                assert!(matches!(result, Err(Error::SessionClosed(id)) if id == session.id));
            }

            it "fails on an unknown session" {
                let id = Uuid::new_v4();
                let result = db.close_session(id, None);
                assert!(matches!(result, Err(Error::UnknownSession(u)) if u == id));
            }

            it "lets the class open a new session afterwards" {
                let session = open_test_session(&db, "cs101");
                db.close_session(session.id, Some(at(50))).unwrap();

                let next = db
                    .create_session(OpenSessionInput::starting_at("cs101", at(120)), "tester")
                    .expect("Failed to reopen");
                assert_ne!(next.id, session.id);
            }
        }

        describe "latest_session_for_class" {
            it "returns None for an unknown class" {
                assert!(db.latest_session_for_class("nope").unwrap().is_none());
            }

            it "prefers the open session" {
                let first = open_test_session(&db, "cs101");
                db.close_session(first.id, Some(at(50))).unwrap();
                let second = db
                    .create_session(OpenSessionInput::starting_at("cs101", at(120)), "tester")
                    .unwrap();

                let latest = db.latest_session_for_class("cs101").unwrap().unwrap();
                assert_eq!(latest.id, second.id);
            }

            it "falls back to the most recent closed session" {
                let first = open_test_session(&db, "cs101");
                db.close_session(first.id, Some(at(50))).unwrap();

                let latest = db.latest_session_for_class("cs101").unwrap().unwrap();
                assert_eq!(latest.id, first.id);
                assert!(db.open_session_for_class("cs101").unwrap().is_none());
            }
        }

        describe "get_sessions_by_class" {
            it "returns sessions oldest first" {
                let first = open_test_session(&db, "cs101");
                db.close_session(first.id, Some(at(50))).unwrap();
                let second = db
                    .create_session(OpenSessionInput::starting_at("cs101", at(120)), "tester")
                    .unwrap();
                open_test_session(&db, "ma201");

                let sessions = db.get_sessions_by_class("cs101").unwrap();
                let ids: Vec<Uuid> = sessions.iter().map(|s| s.id).collect();
                assert_eq!(ids, vec![first.id, second.id]);
            }
        }
    }

    describe "append_event" {
        it "records an rfid event" {
            let session = open_test_session(&db, "cs101");

            let outcome = db
                .append_event(session.id, EventInput::rfid("alice", at(1)), "reader-1")
                .expect("Append failed");

            let event = match outcome {
                AppendOutcome::Recorded { event } => event,
                other => panic!("expected a new event, got {:?}", other),
            };
            assert_eq!(event.session_id, session.id);
            assert_eq!(event.source, EventSource::Rfid);
            assert_eq!(event.subject_id.as_deref(), Some("alice"));
            assert_eq!(event.count, None);
            assert_eq!(event.dedup_key.as_deref(), Some("alice"));
            assert_eq!(event.timestamp, at(1));
            assert_eq!(event.recorded_by, "reader-1");
        }

        it "records a headcount event" {
            let session = open_test_session(&db, "cs101");

            let outcome = db
                .append_event(session.id, EventInput::headcount(12, at(1)), "teacher")
                .unwrap();

            assert!(!outcome.is_duplicate());
            assert_eq!(outcome.event().count, Some(12));
            assert!(outcome.event().subject_id.is_none());
        }

        it "assigns increasing sequence numbers" {
            let session = open_test_session(&db, "cs101");

            let a = db.append_event(session.id, EventInput::rfid("alice", at(1)), "r").unwrap();
            let b = db.append_event(session.id, EventInput::rfid("bob", at(1)), "r").unwrap();
            assert!(b.event().seq > a.event().seq);
        }

        describe "deduplication" {
            it "collapses a repeat scan within the tolerance" {
                let session = open_test_session(&db, "cs101");
                let first = db
                    .append_event(session.id, EventInput::rfid("alice", at(1)), "r")
                    .unwrap();

                let repeat = db
                    .append_event(
                        session.id,
                        EventInput::rfid("alice", at(1) + Duration::seconds(3)),
                        "r",
                    )
                    .unwrap();

                assert!(repeat.is_duplicate());
                assert_eq!(repeat.event().id, first.event().id);
                assert_eq!(collect(&db, session.id, TimeRange::all()).len(), 1);
            }

            it "treats the tolerance boundary as inclusive" {
                let session = open_test_session(&db, "cs101");
                db.append_event(session.id, EventInput::rfid("alice", at(1)), "r").unwrap();

                let repeat = db
                    .append_event(
                        session.id,
                        EventInput::rfid("alice", at(1) + Duration::seconds(5)),
                        "r",
                    )
                    .unwrap();
                assert!(repeat.is_duplicate());
            }

            it "keeps scans further apart than the tolerance" {
                let session = open_test_session(&db, "cs101");
                db.append_event(session.id, EventInput::rfid("alice", at(1)), "r").unwrap();

                let later = db
                    .append_event(
                        session.id,
                        EventInput::rfid("alice", at(1) + Duration::seconds(6)),
                        "r",
                    )
                    .unwrap();
                assert!(!later.is_duplicate());
                assert_eq!(collect(&db, session.id, TimeRange::all()).len(), 2);
            }

            it "collapses an identical resubmission" {
                let session = open_test_session(&db, "cs101");
                let input = EventInput::headcount(20, at(5)).with_dedup_key("upload-7");

                let first = db.append_event(session.id, input.clone(), "r").unwrap();
                let again = db.append_event(session.id, input, "r").unwrap();

                assert!(!first.is_duplicate());
                assert!(again.is_duplicate());
                assert_eq!(again.event(), first.event());
            }

            it "never collapses headcounts without a key" {
                let session = open_test_session(&db, "cs101");
                db.append_event(session.id, EventInput::headcount(20, at(5)), "r").unwrap();

                let second = db
                    .append_event(session.id, EventInput::headcount(20, at(5)), "r")
                    .unwrap();
                assert!(!second.is_duplicate());
            }

            it "honors a custom tolerance" {
                let db = db.with_dedup_tolerance(Duration::zero());
                let session = open_test_session(&db, "cs101");
                db.append_event(session.id, EventInput::rfid("alice", at(1)), "r").unwrap();

                let later = db
                    .append_event(
                        session.id,
                        EventInput::rfid("alice", at(1) + Duration::milliseconds(1)),
                        "r",
                    )
                    .unwrap();
                assert!(!later.is_duplicate());
            }
        }

        describe "validation" {
            it "fails for an unknown session" {
                let id = Uuid::new_v4();
                let result = db.append_event(id, EventInput::rfid("alice", at(1)), "r");
                assert!(matches!(result, Err(Error::UnknownSession(u)) if u == id));
            }

            it "fails for a closed session and stores nothing" {
                let session = open_test_session(&db, "cs101");
                db.append_event(session.id, EventInput::rfid("alice", at(1)), "r").unwrap();
                db.close_session(session.id, Some(at(50))).unwrap();

                let result = db.append_event(session.id, EventInput::rfid("bob", at(2)), "r");
                assert!(matches!(result, Err(Error::SessionClosed(id)) if id == session.id));
                assert_eq!(collect(&db, session.id, TimeRange::all()).len(), 1);
            }

            it "rejects a negative headcount" {
                let session = open_test_session(&db, "cs101");
                let result = db.append_event(session.id, EventInput::headcount(-1, at(1)), "r");
                assert!(matches!(result, Err(Error::InvalidEvent(_))));
            }

            it "rejects an rfid event without a subject" {
                let session = open_test_session(&db, "cs101");
                let mut input = EventInput::rfid("", at(1));
                input.subject_id = None;

                let result = db.append_event(session.id, input, "r");
                assert!(matches!(result, Err(Error::InvalidEvent(_))));
            }

            it "rejects an rfid event carrying a count" {
                let session = open_test_session(&db, "cs101");
                let mut input = EventInput::rfid("alice", at(1));
                input.count = Some(3);

                let result = db.append_event(session.id, input, "r");
                assert!(matches!(result, Err(Error::InvalidEvent(_))));
            }

            it "rejects a headcount carrying a subject" {
                let session = open_test_session(&db, "cs101");
                let mut input = EventInput::headcount(3, at(1));
                input.subject_id = Some("alice".to_string());

                let result = db.append_event(session.id, input, "r");
                assert!(matches!(result, Err(Error::InvalidEvent(_))));
            }

            it "rejects events before the session start" {
                let session = open_test_session(&db, "cs101");
                let result = db.append_event(session.id, EventInput::rfid("alice", at(-1)), "r");
                assert!(matches!(result, Err(Error::InvalidEvent(_))));
            }

            it "rejects events dated far in the future" {
                let session = open_test_session(&db, "cs101");
                let twenty_years = 20 * 365 * 24 * 60;

                let result = db.append_event(session.id, EventInput::rfid("alice", at(twenty_years)), "r");
                assert!(matches!(result, Err(Error::InvalidEvent(_))));
                let result = db.append_event(session.id, EventInput::headcount(3, at(twenty_years)), "t");
                assert!(matches!(result, Err(Error::InvalidEvent(_))));
                assert!(collect(&db, session.id, TimeRange::default()).is_empty());
            }

            it "accepts events slightly ahead of the server clock" {
                let session = open_test_session(&db, "cs101");
                let soon = Utc::now() + Duration::seconds(30);

                let result = db.append_event(session.id, EventInput::rfid("alice", soon), "r");
                assert!(matches!(result, Ok(AppendOutcome::Recorded { .. })));
            }
        }
    }

    describe "query_events" {
        it "orders by timestamp then sequence" {
            let session = open_test_session(&db, "cs101");
            db.append_event(session.id, EventInput::rfid("carol", at(30)), "r").unwrap();
            db.append_event(session.id, EventInput::rfid("alice", at(10)), "r").unwrap();
            db.append_event(session.id, EventInput::rfid("bob", at(10)), "r").unwrap();

            let subjects: Vec<String> = collect(&db, session.id, TimeRange::all())
                .into_iter()
                .filter_map(|e| e.subject_id)
                .collect();
            assert_eq!(subjects, vec!["alice", "bob", "carol"]);
        }

        it "restricts to a half-open range" {
            let session = open_test_session(&db, "cs101");
            for (subject, min) in [("a", 0), ("b", 10), ("c", 20), ("d", 30)] {
                db.append_event(session.id, EventInput::rfid(subject, at(min)), "r").unwrap();
            }

            let events = collect(&db, session.id, TimeRange::between(at(10), at(30)));
            let subjects: Vec<&str> = events.iter().filter_map(|e| e.subject_id.as_deref()).collect();
            assert_eq!(subjects, vec!["b", "c"]);
        }

        it "only returns events of the requested session" {
            let cs = open_test_session(&db, "cs101");
            let ma = open_test_session(&db, "ma201");
            db.append_event(cs.id, EventInput::rfid("alice", at(1)), "r").unwrap();
            db.append_event(ma.id, EventInput::rfid("bob", at(1)), "r").unwrap();

            let events = collect(&db, cs.id, TimeRange::all());
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].subject_id.as_deref(), Some("alice"));
        }

        it "fails for an unknown session" {
            let result = db.query_events(Uuid::new_v4(), TimeRange::all());
            assert!(matches!(result, Err(Error::UnknownSession(_))));
        }

        it "is restartable and unaffected by later appends" {
            let session = open_test_session(&db, "cs101");
            db.append_event(session.id, EventInput::rfid("alice", at(1)), "r").unwrap();
            db.append_event(session.id, EventInput::rfid("bob", at(2)), "r").unwrap();

            let query = db.query_events(session.id, TimeRange::all()).unwrap();
            let first: Vec<_> = query.iter().collect::<rollcall::Result<_>>().unwrap();

            db.append_event(session.id, EventInput::rfid("carol", at(3)), "r").unwrap();
            let second: Vec<_> = query.iter().collect::<rollcall::Result<_>>().unwrap();

            assert_eq!(first.len(), 2);
            assert_eq!(first, second);
            assert_eq!(collect(&db, session.id, TimeRange::all()).len(), 3);
        }

        it "pages through large sessions" {
            let session = open_test_session(&db, "cs101");
            for i in 0..25 {
                db.append_event(
                    session.id,
                    EventInput::rfid(format!("student-{}", i), at(i % 7)),
                    "r",
                )
                .unwrap();
            }

            let query = db
                .query_events(session.id, TimeRange::all())
                .unwrap()
                .with_page_size(4);
            let events: Vec<_> = query.iter().collect::<rollcall::Result<_>>().unwrap();

            assert_eq!(events.len(), 25);
            assert!(events.windows(2).all(|pair| {
                (pair[0].timestamp, pair[0].seq) < (pair[1].timestamp, pair[1].seq)
            }));
        }

        it "allows abandoning an iteration midway" {
            let session = open_test_session(&db, "cs101");
            for i in 0..10 {
                db.append_event(session.id, EventInput::rfid(format!("s{}", i), at(i)), "r").unwrap();
            }

            let query = db.query_events(session.id, TimeRange::all()).unwrap().with_page_size(3);
            let partial: Vec<_> = query.iter().take(2).collect();
            assert_eq!(partial.len(), 2);

            db.append_event(session.id, EventInput::rfid("late", at(20)), "r").unwrap();
            assert_eq!(query.iter().count(), 10);
        }
    }

    describe "roster" {
        it "enrolls a student" {
            let student = enroll(&db, "Alice", "TAG-1");
            assert_eq!(student.name, "Alice");
            assert_eq!(student.rfid_tag, "TAG-1");

            let found = db.get_student_by_tag("TAG-1").unwrap().unwrap();
            assert_eq!(found, student);
        }

        it "rejects a tag that is already taken" {
            enroll(&db, "Alice", "TAG-1");
            let result = db.create_student(CreateStudentInput {
                name: "Bob".to_string(),
                rfid_tag: "TAG-1".to_string(),
            });
            assert!(matches!(result, Err(Error::DuplicateTag(ref t)) if t == "TAG-1"));
        }

        it "lists students ordered by name" {
            enroll(&db, "Zoe", "TAG-2");
            enroll(&db, "Alice", "TAG-1");

            let names: Vec<String> = db.get_all_students().unwrap().into_iter().map(|s| s.name).collect();
            assert_eq!(names, vec!["Alice", "Zoe"]);
        }

        it "returns None for an unknown tag" {
            assert!(db.get_student_by_tag("missing").unwrap().is_none());
        }
    }

    describe "student_attendance" {
        it "counts attended sessions per class" {
            let alice = enroll(&db, "Alice", "TAG-1");
            let subject = alice.id.to_string();

            let first = open_test_session(&db, "cs101");
            db.append_event(first.id, EventInput::rfid(subject.clone(), at(1)), "r").unwrap();
            db.close_session(first.id, Some(at(50))).unwrap();

            let second = db
                .create_session(OpenSessionInput::starting_at("cs101", at(120)), "tester")
                .unwrap();
            db.close_session(second.id, Some(at(170))).unwrap();

            let third = db
                .create_session(OpenSessionInput::starting_at("cs101", at(240)), "tester")
                .unwrap();
            db.append_event(third.id, EventInput::rfid(subject, at(241)), "r").unwrap();

            let summary = db.student_attendance(alice.id).unwrap();
            assert_eq!(summary.student_id, alice.id);
            assert_eq!(summary.classes.len(), 1);
            let cs = &summary.classes[0];
            assert_eq!(cs.class_id, "cs101");
            assert_eq!(cs.sessions_attended, 2);
            assert_eq!(cs.total_sessions, 3);
            assert_eq!(cs.attendance_percentage, 66.67);
        }

        it "is empty for a student without scans" {
            let alice = enroll(&db, "Alice", "TAG-1");
            let summary = db.student_attendance(alice.id).unwrap();
            assert!(summary.classes.is_empty());
        }

        it "fails for an unknown student" {
            let result = db.student_attendance(Uuid::new_v4());
            assert!(matches!(result, Err(Error::UnknownStudent(_))));
        }
    }

    describe "get_headcounts_by_class" {
        it "returns headcounts across sessions oldest first" {
            let first = open_test_session(&db, "cs101");
            db.append_event(first.id, EventInput::headcount(10, at(5)), "t").unwrap();
            db.append_event(first.id, EventInput::rfid("alice", at(6)), "r").unwrap();
            db.close_session(first.id, Some(at(50))).unwrap();

            let second = db
                .create_session(OpenSessionInput::starting_at("cs101", at(120)), "tester")
                .unwrap();
            db.append_event(second.id, EventInput::headcount(14, at(125)), "t").unwrap();

            let points = db.get_headcounts_by_class("cs101").unwrap();
            assert_eq!(
                points,
                vec![
                    HeadcountPoint { count: 10, timestamp: at(5) },
                    HeadcountPoint { count: 14, timestamp: at(125) },
                ]
            );
        }

        it "is empty for an unknown class" {
            assert!(db.get_headcounts_by_class("nope").unwrap().is_empty());
        }
    }

    describe "event logs across classes" {
        it "lists every scan with its class, oldest first" {
            let cs = open_test_session(&db, "cs101");
            let ma = open_test_session(&db, "ma201");
            db.append_event(ma.id, EventInput::rfid("bob", at(7)), "r").unwrap();
            db.append_event(cs.id, EventInput::rfid("alice", at(3)), "r").unwrap();
            db.append_event(cs.id, EventInput::headcount(2, at(4)), "t").unwrap();

            let scans = db.get_all_scans().unwrap();
            let seen: Vec<(&str, &str, DateTime<Utc>)> = scans
                .iter()
                .map(|s| (s.class_id.as_str(), s.subject_id.as_str(), s.timestamp))
                .collect();
            assert_eq!(seen, vec![("cs101", "alice", at(3)), ("ma201", "bob", at(7))]);
            assert_eq!(scans[0].session_id, cs.id);
        }

        it "lists every headcount with its class, oldest first" {
            let cs = open_test_session(&db, "cs101");
            let ma = open_test_session(&db, "ma201");
            db.append_event(cs.id, EventInput::headcount(12, at(9)), "t").unwrap();
            db.append_event(ma.id, EventInput::headcount(30, at(2)), "t").unwrap();
            db.append_event(ma.id, EventInput::rfid("bob", at(3)), "r").unwrap();

            let headcounts = db.get_all_headcounts().unwrap();
            let seen: Vec<(&str, u32)> = headcounts
                .iter()
                .map(|h| (h.class_id.as_str(), h.count))
                .collect();
            assert_eq!(seen, vec![("ma201", 30), ("cs101", 12)]);
            assert_eq!(headcounts[0].session_id, ma.id);
        }

        it "is empty for a fresh store" {
            assert!(db.get_all_scans().unwrap().is_empty());
            assert!(db.get_all_headcounts().unwrap().is_empty());
        }
    }

    describe "file-backed store" {
        it "keeps events across reopen" {
            let dir = tempfile::tempdir().expect("Failed to create temp dir");
            let path = dir.path().join("rollcall.db");

            let session_id = {
                let db = Database::open(path.clone()).unwrap();
                db.migrate().unwrap();
                let session = open_test_session(&db, "cs101");
                db.append_event(session.id, EventInput::rfid("alice", at(1)), "r").unwrap();
                session.id
            };

            let reopened = Database::open(path).unwrap();
            reopened.migrate().unwrap();
            let events = collect(&reopened, session_id, TimeRange::all());
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].subject_id.as_deref(), Some("alice"));
        }
    }
}
