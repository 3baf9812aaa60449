use state_machines::state_machine;

state_machine! {
    name: IngestionMachine,
    state: IngestionState,
    initial: Ready,
    states: [Ready, Chunked, Extracted, Resolved, Invalidated, Persisted, Failed],
    events {
        chunk { transition: { from: Ready, to: Chunked } }
        extract { transition: { from: Chunked, to: Extracted } }
        resolve { transition: { from: Extracted, to: Resolved } }
        invalidate { transition: { from: Resolved, to: Invalidated } }
        persist { transition: { from: Invalidated, to: Persisted } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Chunked, to: Failed }
            transition: { from: Extracted, to: Failed }
            transition: { from: Resolved, to: Failed }
            transition: { from: Invalidated, to: Failed }
            transition: { from: Persisted, to: Failed }
        }
    }
}

pub fn ready() -> IngestionMachine<(), Ready> {
    IngestionMachine::new(())
}
