use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    commands::EraBeginKind,
    types::*,
    vm::{EraStep, EraVm, EraVmResult},
};

/// Number of save slots offered by the builtin save/load menus.
pub const SAVE_SLOT_COUNT: i64 = 20;
/// Menu choice that leaves the save/load menus.
pub const MENU_BACK: i64 = 100;
/// Item numbers at or above this go to `USERSHOP`.
pub const SHOP_ITEM_COUNT: i64 = 100;

/// Steps of the fixed game flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
pub enum EraPhase {
    TitleBegin,
    TitleWaitInput,
    TitleEnd,
    FirstBegin,
    FirstEnd,
    TrainBegin,
    TrainShowStatus,
    TrainComAbleStart,
    TrainComAbleCall,
    TrainComAbleCheck,
    TrainShowUserCom,
    TrainWaitInput,
    TrainCallUserCom,
    TrainCallEventCom,
    TrainCallCom,
    TrainCallSourceCheck,
    TrainCallEventComEnd,
    AfterTrainBegin,
    AblupBegin,
    AblupShowSelect,
    AblupWaitInput,
    AblupCallAblup,
    AblupCallUserAblup,
    TurnendBegin,
    ShopBegin,
    ShopShowShop,
    ShopWaitInput,
    ShopCallEventBuy,
    ShopCallUserShop,
    SaveGameShowMenu,
    SaveGameWaitInput,
    SaveGameCallSaveInfo,
    /// Hands the `SAVEINFO` result to the host.
    SaveGameWrite,
    LoadGameShowMenu,
    LoadGameWaitInput,
    LoadDataCallSystemLoad,
    LoadDataCallEventLoad,
    LoadDataEnd,
    Quit,
}

impl From<EraBeginKind> for EraPhase {
    fn from(kind: EraBeginKind) -> Self {
        match kind {
            EraBeginKind::Title => EraPhase::TitleBegin,
            EraBeginKind::First => EraPhase::FirstBegin,
            EraBeginKind::Train => EraPhase::TrainBegin,
            EraBeginKind::AfterTrain => EraPhase::AfterTrainBegin,
            EraBeginKind::Ablup => EraPhase::AblupBegin,
            EraBeginKind::TurnEnd => EraPhase::TurnendBegin,
            EraBeginKind::Shop => EraPhase::ShopBegin,
        }
    }
}

impl<C: EraCompilerCallback> EraVm<'_, C> {
    /// Runs one step of the game flow. Called only while no frame is active.
    /// The next phase is set before the hook is entered, and a pending
    /// `BEGIN` takes precedence over it.
    pub(crate) fn advance_phase(&mut self) -> EraVmResult<EraStep> {
        use EraPhase::*;

        self.site = None;
        if let Some(kind) = self.state.pending_begin.take() {
            self.state.set_phase(kind.into());
            return Ok(EraStep::Continue);
        }
        match self.state.phase() {
            TitleBegin => {
                if self.hook_exists("SYSTEM_TITLE") {
                    self.goto_phase(TitleEnd);
                    return self.call_hook("SYSTEM_TITLE");
                }
                self.print_line("[0] New game");
                self.print_line("[1] Load game");
                self.goto_phase(TitleWaitInput);
            }
            TitleWaitInput => match self.take_int_input() {
                None => return Ok(waiting()),
                Some(0) => self.goto_phase(FirstBegin),
                Some(1) => {
                    self.goto_phase(TitleBegin);
                    self.state.push_snapshot();
                    self.goto_phase(LoadGameShowMenu);
                }
                Some(_) => (),
            },
            TitleEnd | FirstEnd => self.goto_phase(Quit),
            FirstBegin => {
                if self.labels.get_event("EVENTFIRST").is_none() {
                    return Err(self.fault("EVENTFIRST is not defined"));
                }
                self.goto_phase(FirstEnd);
                return self.call_event_hook("EVENTFIRST");
            }
            TrainBegin => return self.hook_then(TrainShowStatus, "EVENTTRAIN", true),
            TrainShowStatus => return self.hook_then(TrainComAbleStart, "SHOW_STATUS", false),
            TrainComAbleStart => {
                let coms: Vec<i64> = self
                    .labels
                    .funcs()
                    .filter_map(|(name, _)| name.strip_prefix("COM")?.parse().ok())
                    .sorted_unstable()
                    .dedup()
                    .collect();
                let flow = &mut self.state.flow;
                flow.coms = coms;
                flow.com_index = 0;
                flow.available.clear();
                self.goto_phase(TrainComAbleCall);
            }
            TrainComAbleCall => {
                let flow = &self.state.flow;
                let Some(&com) = flow.coms.get(flow.com_index) else {
                    self.goto_phase(TrainShowUserCom);
                    return Ok(EraStep::Continue);
                };
                let able = format!("COM_ABLE{com}");
                if self.hook_exists(&able) {
                    self.set_global("RESULT", 0, ScalarValue::Int(0))?;
                    self.goto_phase(TrainComAbleCheck);
                    return self.call_hook(&able);
                }
                let flow = &mut self.state.flow;
                flow.available.push(com);
                flow.com_index += 1;
            }
            TrainComAbleCheck => {
                let able = self.global_int("RESULT", 0)? != 0;
                let flow = &mut self.state.flow;
                if let Some(&com) = flow.coms.get(flow.com_index) {
                    if able {
                        flow.available.push(com);
                    }
                }
                flow.com_index += 1;
                self.goto_phase(TrainComAbleCall);
            }
            TrainShowUserCom => {
                if self.hook_exists("SHOW_USERCOM") {
                    self.goto_phase(TrainWaitInput);
                    return self.call_hook("SHOW_USERCOM");
                }
                for com in self.state.flow.available.clone() {
                    self.print_line(&format!("[{com}] COM{com}"));
                }
                self.goto_phase(TrainWaitInput);
            }
            TrainWaitInput => {
                let Some(n) = self.take_int_input() else {
                    return Ok(waiting());
                };
                if self.state.flow.available.contains(&n) {
                    self.state.flow.selected = n;
                    self.set_global("SELECTCOM", 0, ScalarValue::Int(n))?;
                    self.goto_phase(TrainCallEventCom);
                } else {
                    self.set_global("RESULT", 0, ScalarValue::Int(n))?;
                    self.goto_phase(TrainCallUserCom);
                }
            }
            TrainCallUserCom => return self.hook_then(TrainShowStatus, "USERCOM", false),
            TrainCallEventCom => return self.hook_then(TrainCallCom, "EVENTCOM", true),
            TrainCallCom => {
                let com = format!("COM{}", self.state.flow.selected);
                return self.hook_then(TrainCallSourceCheck, &com, false);
            }
            TrainCallSourceCheck => {
                return self.hook_then(TrainCallEventComEnd, "SOURCE_CHECK", false)
            }
            TrainCallEventComEnd => return self.hook_then(TrainShowStatus, "EVENTCOMEND", true),
            AfterTrainBegin => return self.hook_then(AblupBegin, "EVENTEND", true),
            AblupBegin => return self.hook_then(AblupShowSelect, "SHOW_JUEL", false),
            AblupShowSelect => return self.hook_then(AblupWaitInput, "SHOW_ABLUP_SELECT", false),
            AblupWaitInput => {
                let Some(n) = self.take_int_input() else {
                    return Ok(waiting());
                };
                if self.hook_exists(&format!("ABLUP{n}")) {
                    self.state.flow.selected = n;
                    self.goto_phase(AblupCallAblup);
                } else {
                    self.set_global("RESULT", 0, ScalarValue::Int(n))?;
                    self.goto_phase(AblupCallUserAblup);
                }
            }
            AblupCallAblup => {
                let ablup = format!("ABLUP{}", self.state.flow.selected);
                return self.hook_then(AblupBegin, &ablup, false);
            }
            AblupCallUserAblup => return self.hook_then(AblupBegin, "USERABLUP", false),
            TurnendBegin => return self.hook_then(ShopBegin, "EVENTTURNEND", true),
            ShopBegin => return self.hook_then(ShopShowShop, "EVENTSHOP", true),
            ShopShowShop => {
                if self.hook_exists("SHOW_SHOP") {
                    self.goto_phase(ShopWaitInput);
                    return self.call_hook("SHOW_SHOP");
                }
                self.print_item_table()?;
                self.goto_phase(ShopWaitInput);
            }
            ShopWaitInput => {
                let Some(n) = self.take_int_input() else {
                    return Ok(waiting());
                };
                if self.try_buy(n)? {
                    self.goto_phase(ShopCallEventBuy);
                } else {
                    self.set_global("RESULT", 0, ScalarValue::Int(n))?;
                    self.goto_phase(ShopCallUserShop);
                }
            }
            ShopCallEventBuy => return self.hook_then(ShopShowShop, "EVENTBUY", true),
            ShopCallUserShop => return self.hook_then(ShopShowShop, "USERSHOP", false),
            SaveGameShowMenu => {
                self.print_slots();
                self.goto_phase(SaveGameWaitInput);
            }
            SaveGameWaitInput => match self.take_int_input() {
                None => return Ok(waiting()),
                Some(MENU_BACK) => self.leave_menu(),
                Some(slot) if (0..SAVE_SLOT_COUNT).contains(&slot) => {
                    self.state.flow.slot = slot;
                    self.goto_phase(SaveGameCallSaveInfo);
                }
                Some(_) => (),
            },
            SaveGameCallSaveInfo => {
                self.set_global("RESULTS", 0, ScalarValue::Str(String::new()))?;
                return self.hook_then(SaveGameWrite, "SAVEINFO", false);
            }
            SaveGameWrite => {
                let info = self.global_str("RESULTS", 0)?;
                let slot = self.state.flow.slot;
                if let Err(e) = self.callback.on_save_game(slot, &info) {
                    return Err(self.host_fault(format!("saving slot {slot} failed: {e:#}")));
                }
                self.goto_phase(SaveGameShowMenu);
            }
            LoadGameShowMenu => {
                self.print_slots();
                self.goto_phase(LoadGameWaitInput);
            }
            LoadGameWaitInput => match self.take_int_input() {
                None => return Ok(waiting()),
                Some(MENU_BACK) => self.leave_menu(),
                Some(slot) if (0..SAVE_SLOT_COUNT).contains(&slot) => {
                    match self.callback.on_load_game(slot) {
                        Ok(true) => {
                            self.state.clear_snapshots();
                            self.goto_phase(LoadDataCallSystemLoad);
                        }
                        Ok(false) => {
                            self.print_line(&format!("Slot {slot} cannot be loaded"));
                            self.goto_phase(LoadGameShowMenu);
                        }
                        Err(e) => {
                            return Err(self.host_fault(format!("loading slot {slot} failed: {e:#}")))
                        }
                    }
                }
                Some(_) => (),
            },
            LoadDataCallSystemLoad => {
                return self.hook_then(LoadDataCallEventLoad, "SYSTEM_LOAD", false)
            }
            LoadDataCallEventLoad => return self.hook_then(LoadDataEnd, "EVENTLOAD", true),
            LoadDataEnd => self.goto_phase(ShopBegin),
            Quit => return Ok(EraStep::Break(EraExecutionBreakReason::CodeQuit)),
        }
        Ok(EraStep::Continue)
    }

    fn goto_phase(&mut self, phase: EraPhase) {
        self.state.set_phase(phase);
    }

    /// Sets the next phase, then calls the hook if there is one.
    fn hook_then(&mut self, next: EraPhase, hook: &str, is_event: bool) -> EraVmResult<EraStep> {
        self.goto_phase(next);
        if is_event {
            self.call_event_hook(hook)
        } else {
            self.call_hook(hook)
        }
    }

    fn hook_exists(&self, name: &str) -> bool {
        self.labels.get_func(name).is_some()
            || (self.opts.compat_call_event_as_function && self.labels.is_event(name))
    }

    /// Calls an ordinary hook. An absent hook is skipped.
    fn call_hook(&mut self, name: &str) -> EraVmResult<EraStep> {
        if let Some(target) = self.labels.get_func(name) {
            return self.call_root(target);
        }
        if self.labels.is_event(name) {
            if !self.opts.compat_call_event_as_function {
                return Err(self.fault(format!(
                    "`{name}` is an event function and cannot be called as a function"
                )));
            }
            return self.call_event(name, None, None, false);
        }
        Ok(EraStep::Continue)
    }

    /// Dispatches an event hook. An absent hook is skipped.
    fn call_event_hook(&mut self, name: &str) -> EraVmResult<EraStep> {
        if self.labels.is_event(name) {
            return self.call_event(name, None, None, false);
        }
        if let Some(target) = self.labels.get_func(name) {
            if !self.opts.compat_call_function_as_event {
                return Err(self.fault(format!(
                    "`{name}` is an ordinary function and cannot be called as an event"
                )));
            }
            return self.call_root(target);
        }
        Ok(EraStep::Continue)
    }

    fn take_int_input(&mut self) -> Option<i64> {
        loop {
            let input = self.state.take_input()?;
            if let Some(n) = input.as_int() {
                return Some(n);
            }
        }
    }

    fn leave_menu(&mut self) {
        if !self.state.pop_snapshot() {
            self.goto_phase(EraPhase::TitleBegin);
        }
    }

    fn print_line(&mut self, text: &str) {
        let flags = EraPrintExtendedFlags::new().with_is_line(true);
        self.callback.on_print(text, flags);
    }

    fn print_slots(&mut self) {
        for slot in 0..SAVE_SLOT_COUNT {
            let info = self.callback.on_get_save_info(slot);
            let info = info.as_deref().unwrap_or("----");
            self.print_line(&format!("[{slot:02}] {info}"));
        }
        self.print_line(&format!("[{MENU_BACK}] Back"));
    }

    fn print_item_table(&mut self) -> EraVmResult<()> {
        for item in 0..SHOP_ITEM_COUNT {
            if self.global_int("ITEMSALES", item)? == 0 {
                continue;
            }
            let price = self.global_int("ITEMPRICE", item)?;
            self.print_line(&format!("[{item}] ITEM{item} ({price})"));
        }
        let money = self.global_int("MONEY", 0)?;
        self.print_line(&format!("MONEY: {money}"));
        Ok(())
    }

    /// Buys item `n` if it is on sale and affordable.
    fn try_buy(&mut self, n: i64) -> EraVmResult<bool> {
        if !(0..SHOP_ITEM_COUNT).contains(&n) || self.global_int("ITEMSALES", n)? == 0 {
            return Ok(false);
        }
        let price = self.global_int("ITEMPRICE", n)?;
        let money = self.global_int("MONEY", 0)?;
        if money < price {
            return Ok(false);
        }
        let Some(left) = money.checked_sub(price) else {
            return Ok(false);
        };
        let Some(owned) = self.global_int("ITEM", n)?.checked_add(1) else {
            return Ok(false);
        };
        self.set_global("MONEY", 0, ScalarValue::Int(left))?;
        self.set_global("ITEM", n, ScalarValue::Int(owned))?;
        self.set_global("BOUGHT", 0, ScalarValue::Int(n))?;
        Ok(true)
    }
}

fn waiting() -> EraStep {
    EraStep::Break(EraExecutionBreakReason::WaitingForInput)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_keywords_map_to_phases() {
        assert_eq!(EraPhase::from(EraBeginKind::TurnEnd), EraPhase::TurnendBegin);
        assert_eq!(EraPhase::from(EraBeginKind::Shop), EraPhase::ShopBegin);
        assert_eq!(EraPhase::ShopWaitInput.to_string(), "ShopWaitInput");
    }
}
