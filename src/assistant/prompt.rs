//! System prompt and the per-turn context note.

use chrono::NaiveDateTime;

use crate::memory::types::ScoredFact;
use crate::schedule::ScheduleEntry;

/// Used when no instructions file is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are femtobot, a helpful personal assistant running on the user's own computer.
Answer concisely and in the user's language.

You can act by writing commands anywhere in your reply. The user never sees them.
Write each command exactly as shown, opened and closed with three colons:

:::memory <fact>:::                       remember a lasting fact about the user
:::memory_delete <fact>:::                forget the stored fact closest to <fact>
:::cron <unico|recurrente> <min> <hour> <day> <month> <label>:::
                                          schedule a reminder (use * for "every")
:::cron_delete "<label>":::               remove reminders whose line contains <label>
:::search <query>:::                      search the web; you will get the results and answer again
:::foto <query>:::                        show the user images
:::luz <name|todas> <encender|apagar|brillo|color> [value]:::
                                          control smart lights (brillo 0-100, color: rojo, verde,
                                          azul, amarillo, naranja, rosa, morado, violeta, celeste,
                                          blanco, calido, frio)

To change a reminder, delete it and create it again in the same reply.
Reminder labels must not contain quotes, $, ;, |, &, <, >, backslashes, parentheses, braces or %.
Only save facts that will still matter in future conversations."#;

/// Ephemeral system note appended to the context of each turn. Never stored
/// in the session history.
pub fn context_note(now: NaiveDateTime, facts: &[ScoredFact], schedule: &[ScheduleEntry]) -> String {
    let mut note = format!("[System: the current time is {}.", now.format("%A %Y-%m-%d %H:%M"));

    if schedule.is_empty() {
        note.push_str(" Scheduled reminders: (none).");
    } else {
        note.push_str(" Scheduled reminders:");
        for entry in schedule {
            note.push_str(&format!("\n- {} {}", entry.expression, entry.command));
        }
    }

    if !facts.is_empty() {
        note.push_str("\nRelevant memories:");
        for fact in facts {
            note.push_str(&format!("\n- {}", fact.content));
        }
    }
    note.push(']');
    note
}
